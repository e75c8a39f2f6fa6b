//! Scoped ownership of the hypervisor connection for one batch.
//!
//! The handle is opened lazily on first use and shared by every worker.
//! When a call reports the connection lost, the manager reopens it, at most
//! `reconnect_attempts` times per manager. Once a reconnect fails (or the
//! budget is spent) the manager is marked lost and stays that way.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::error::VmsError;
use crate::hypervisor::{Connector, HypervisorError};

/// Error raised from inside a blocking hypervisor call.
#[derive(Debug)]
pub enum CallError {
    /// The core refused to perform the call (failed precondition).
    Rejected(VmsError),
    Hypervisor(HypervisorError),
}

impl From<HypervisorError> for CallError {
    fn from(e: HypervisorError) -> Self {
        CallError::Hypervisor(e)
    }
}

impl From<VmsError> for CallError {
    fn from(e: VmsError) -> Self {
        CallError::Rejected(e)
    }
}

/// Which try of a call this is.
///
/// A retry runs on a fresh handle after the first try lost its connection.
/// The first try may still have taken effect before the connection dropped,
/// so calls that change state re-read it on a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Retry,
}

/// A shared handle together with the connection generation it belongs to.
pub struct Lease<H> {
    handle: Arc<H>,
    generation: u64,
}

impl<H> Clone for Lease<H> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            generation: self.generation,
        }
    }
}

impl<H> Deref for Lease<H> {
    type Target = H;
    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H> Lease<H> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Slot<H> {
    handle: Option<Arc<H>>,
    generation: u64,
    reconnects: u32,
}

pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    target: Option<String>,
    reconnect_attempts: u32,
    slot: Mutex<Slot<C::Handle>>,
    lost: AtomicBool,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, target: Option<String>, reconnect_attempts: u32) -> Self {
        Self {
            connector: Arc::new(connector),
            target,
            reconnect_attempts,
            slot: Mutex::new(Slot {
                handle: None,
                generation: 0,
                reconnects: 0,
            }),
            lost: AtomicBool::new(false),
        }
    }

    /// The connection target for messages.
    pub fn target(&self) -> &str {
        self.target.as_deref().unwrap_or("the default hypervisor")
    }

    /// True once the connection is unusable for the rest of the batch.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub(crate) fn lost_error(&self) -> VmsError {
        self.connection_error("reconnect attempts exhausted")
    }

    fn connection_error(&self, message: impl Into<String>) -> VmsError {
        VmsError::Connection {
            target: self.target().to_string(),
            message: message.into(),
        }
    }

    /// Return the live handle, opening it on first use.
    pub async fn acquire(&self) -> Result<Lease<C::Handle>, VmsError> {
        if self.is_lost() {
            return Err(self.lost_error());
        }
        let mut slot = self.slot.lock().await;
        if let Some(handle) = &slot.handle {
            return Ok(Lease {
                handle: handle.clone(),
                generation: slot.generation,
            });
        }

        tracing::debug!(target_uri = self.target(), "opening hypervisor connection");
        match self.open().await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                slot.handle = Some(handle.clone());
                slot.generation += 1;
                Ok(Lease {
                    handle,
                    generation: slot.generation,
                })
            }
            Err(e) => {
                self.lost.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Replace the handle of generation `broken` with a fresh one.
    ///
    /// Workers that hit the same broken handle concurrently share a single
    /// reconnect: later callers get the already-replaced handle.
    pub async fn reconnect(&self, broken: u64) -> Result<Lease<C::Handle>, VmsError> {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = &slot.handle
            && slot.generation != broken
        {
            return Ok(Lease {
                handle: handle.clone(),
                generation: slot.generation,
            });
        }
        if self.is_lost() {
            return Err(self.lost_error());
        }

        slot.handle = None;
        if slot.reconnects >= self.reconnect_attempts {
            self.lost.store(true, Ordering::SeqCst);
            return Err(self.lost_error());
        }
        slot.reconnects += 1;

        tracing::warn!(
            target_uri = self.target(),
            attempt = slot.reconnects,
            "hypervisor connection lost, reconnecting"
        );
        match self.open().await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                slot.handle = Some(handle.clone());
                slot.generation += 1;
                tracing::info!(target_uri = self.target(), "reconnected");
                Ok(Lease {
                    handle,
                    generation: slot.generation,
                })
            }
            Err(e) => {
                self.lost.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Drop the manager's handle. Outstanding leases keep it alive until they
    /// finish; the connection closes with the last one.
    pub async fn release(&self) {
        let mut slot = self.slot.lock().await;
        if slot.handle.take().is_some() {
            tracing::debug!(target_uri = self.target(), "released hypervisor connection");
        }
    }

    async fn open(&self) -> Result<C::Handle, VmsError> {
        let connector = self.connector.clone();
        let target = self.target.clone();
        tokio::task::spawn_blocking(move || connector.open(target.as_deref()))
            .await
            .map_err(|e| self.connection_error(format!("connect task failed: {e}")))?
            .map_err(|e| self.connection_error(e.to_string()))
    }

    /// Run a blocking call against the handle, reconnecting once if the call
    /// reports the connection lost.
    pub async fn run<T, F>(&self, f: F) -> Result<T, VmsError>
    where
        T: Send + 'static,
        F: Fn(&C::Handle, Attempt) -> Result<T, CallError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut lease = self.acquire().await?;
        let mut attempt = Attempt::First;

        loop {
            let call = f.clone();
            let handle = lease.clone();
            let result = tokio::task::spawn_blocking(move || (*call)(&*handle, attempt))
                .await
                .unwrap_or_else(|e| {
                    Err(CallError::Hypervisor(HypervisorError::Failed(format!(
                        "hypervisor call panicked: {e}"
                    ))))
                });

            match result {
                Ok(value) => return Ok(value),
                Err(CallError::Rejected(e)) => return Err(e),
                Err(CallError::Hypervisor(HypervisorError::ConnectionLost(message))) => {
                    if attempt == Attempt::Retry {
                        return Err(self.connection_error(message));
                    }
                    lease = self.reconnect(lease.generation()).await?;
                    attempt = Attempt::Retry;
                }
                Err(CallError::Hypervisor(e)) => {
                    return Err(VmsError::Operation {
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
