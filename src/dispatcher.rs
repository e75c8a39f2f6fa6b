//! Bulk operation dispatch.
//!
//! A fixed pool of workers pulls domains off the selection in order and runs
//! the operation on each through the shared [`ConnectionManager`]. Outcomes
//! are buffered by selection index, so the batch result keeps selection
//! order no matter which worker finishes first.
//!
//! Workers check for cancellation and for a lost connection before taking
//! the next domain. Calls already in flight always run to completion; the
//! domains nobody took are reported as skipped (cancelled) or failed
//! (connection lost).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::addresses::{self, InterfaceAddresses};
use crate::batch::{self, BatchResult, OperationOutcome, Outcome};
use crate::connection::{CallError, ConnectionManager};
use crate::error::VmsError;
use crate::hypervisor::{
    AddressSource, Connector, DomainInfo, Hypervisor, HypervisorError, PowerState,
};
use crate::operation::{self, OperationKind, OperationRequest};
use crate::selector;
use crate::snapshot::SnapshotInfo;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Receives batch progress on the dispatching task.
pub trait BatchObserver: Send + Sync {
    /// Called once, before any domain is started, with the selection size.
    fn on_selected(&self, _total: usize) {}
    fn on_start(&self, _vm: &str) {}
    fn on_outcome(&self, _outcome: &OperationOutcome) {}
}

pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

enum Event {
    Started(usize),
    Finished(usize, Outcome),
}

pub struct Dispatcher<C: Connector> {
    connection: Arc<ConnectionManager<C>>,
    workers: usize,
}

impl<C: Connector> Dispatcher<C> {
    pub fn new(connection: Arc<ConnectionManager<C>>, workers: usize) -> Self {
        Self {
            connection,
            workers: workers.max(1),
        }
    }

    /// One listing of every domain, used as the consistent view for a batch.
    pub async fn list_domains(&self) -> Result<Vec<DomainInfo>, VmsError> {
        self.connection.run(|hv, _| Ok(hv.list_domains()?)).await
    }

    /// Guest clock of each domain, `None` for domains that are not running
    /// or whose guest agent does not answer.
    pub async fn guest_times(&self, vms: &[DomainInfo]) -> Result<Vec<Option<i64>>, VmsError> {
        let mut times = Vec::with_capacity(vms.len());
        for vm in vms {
            if vm.state != PowerState::Running {
                times.push(None);
                continue;
            }
            let name = vm.name.clone();
            let time = self
                .connection
                .run(move |hv, _| unanswered(&name, "guest time", hv.guest_time(&name)))
                .await?;
            times.push(time);
        }
        Ok(times)
    }

    /// Addresses of the running domains among `vms`, merged across leases,
    /// the guest agent and ARP.
    pub async fn list_addresses(
        &self,
        vms: &[DomainInfo],
    ) -> Result<Vec<InterfaceAddresses>, VmsError> {
        let mut found = Vec::new();
        for vm in vms.iter().filter(|vm| vm.state == PowerState::Running) {
            let name = vm.name.clone();
            let interfaces = self
                .connection
                .run(move |hv, _| {
                    let mut sources = Vec::new();
                    for source in AddressSource::ALL {
                        let what = format!("{source:?} addresses");
                        if let Some(ifaces) =
                            unanswered(&name, &what, hv.interface_addresses(&name, source))?
                        {
                            sources.push(ifaces);
                        }
                    }
                    Ok(addresses::merge(&name, sources))
                })
                .await?;
            found.extend(interfaces);
        }
        Ok(found)
    }

    pub async fn list_snapshots(&self, vms: &[DomainInfo]) -> Result<Vec<SnapshotInfo>, VmsError> {
        let mut snapshots = Vec::new();
        for vm in vms {
            let name = vm.name.clone();
            let found = self
                .connection
                .run(move |hv, _| Ok(hv.list_snapshots(&name)?))
                .await?;
            snapshots.extend(found);
        }
        Ok(snapshots)
    }

    /// Run `request` over its domains. Every selected domain gets exactly one
    /// outcome, in selection order.
    pub async fn dispatch(
        &self,
        request: OperationRequest,
        cancel: &CancellationToken,
        observer: &dyn BatchObserver,
    ) -> BatchResult {
        let vms: Arc<[DomainInfo]> = request.vms().into();
        let kind = Arc::new(request.kind().clone());
        let pool = self.workers.min(vms.len());
        tracing::info!(
            op = kind.label(),
            domains = vms.len(),
            workers = pool,
            "dispatching batch"
        );

        observer.on_selected(vms.len());

        let next = Arc::new(AtomicUsize::new(0));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        for _ in 0..pool {
            let worker = Worker {
                connection: self.connection.clone(),
                kind: kind.clone(),
                vms: vms.clone(),
                next: next.clone(),
                cancel: cancel.clone(),
                events: events_tx.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(events_tx);

        let mut slots: Vec<Option<OperationOutcome>> = (0..vms.len()).map(|_| None).collect();
        while let Some(event) = events.recv().await {
            match event {
                Event::Started(idx) => observer.on_start(&vms[idx].name),
                Event::Finished(idx, outcome) => {
                    let outcome = OperationOutcome::new(vms[idx].name.as_str(), outcome);
                    observer.on_outcome(&outcome);
                    slots[idx] = Some(outcome);
                }
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("dispatch worker died: {e}");
            }
        }

        let outcomes = slots
            .into_iter()
            .zip(vms.iter())
            .map(|(slot, vm)| {
                slot.unwrap_or_else(|| {
                    let outcome = OperationOutcome::new(vm.name.as_str(), self.unscheduled(cancel));
                    observer.on_outcome(&outcome);
                    outcome
                })
            })
            .collect();

        if cancel.is_cancelled() {
            tracing::warn!(op = kind.label(), "batch cancelled");
        }
        batch::aggregate(request.kind().clone(), outcomes)
    }

    /// Outcome for a domain no worker took.
    fn unscheduled(&self, cancel: &CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            Outcome::Skipped(VmsError::Cancelled)
        } else if self.connection.is_lost() {
            Outcome::Failed(self.connection.lost_error())
        } else {
            Outcome::Failed(VmsError::Operation {
                message: "worker exited before reaching this domain".into(),
            })
        }
    }
}

struct Worker<C: Connector> {
    connection: Arc<ConnectionManager<C>>,
    kind: Arc<OperationKind>,
    vms: Arc<[DomainInfo]>,
    next: Arc<AtomicUsize>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<Event>,
}

impl<C: Connector> Worker<C> {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() || self.connection.is_lost() {
                break;
            }
            let idx = self.next.fetch_add(1, Ordering::SeqCst);
            let Some(vm) = self.vms.get(idx) else {
                break;
            };
            let _ = self.events.send(Event::Started(idx));

            let kind = self.kind.clone();
            let target = vm.clone();
            let result = self
                .connection
                .run(move |hv, attempt| operation::execute(&kind, hv, &target, attempt))
                .await;

            let outcome = Outcome::from(result);
            match &outcome {
                Outcome::Succeeded(_) => {
                    tracing::info!(vm = %vm.name, op = self.kind.label(), "{}", outcome.detail())
                }
                _ => {
                    tracing::warn!(vm = %vm.name, op = self.kind.label(), "{}", outcome.detail())
                }
            }
            let _ = self.events.send(Event::Finished(idx, outcome));
        }
    }
}

/// A lost connection stays an error; any other failure just means the
/// domain gave no answer.
fn unanswered<T>(
    vm: &str,
    what: &str,
    result: Result<T, HypervisorError>,
) -> Result<Option<T>, CallError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e @ HypervisorError::ConnectionLost(_)) => Err(e.into()),
        Err(e) => {
            tracing::debug!(vm, "no {what}: {e}");
            Ok(None)
        }
    }
}

/// Resolve `patterns` against a fresh listing and dispatch `kind` over the
/// selection. Selection errors abort before any domain is touched.
pub async fn resolve_and_dispatch<C: Connector, S: AsRef<str>>(
    dispatcher: &Dispatcher<C>,
    patterns: &[S],
    kind: OperationKind,
    cancel: &CancellationToken,
    observer: &dyn BatchObserver,
) -> Result<BatchResult, VmsError> {
    kind.validate()?;
    let domains = dispatcher.list_domains().await?;
    let vms = selector::resolve_patterns(patterns, &domains)?;
    tracing::debug!(op = kind.label(), selected = vms.len(), "resolved selection");
    Ok(dispatcher
        .dispatch(OperationRequest::new(kind, vms), cancel, observer)
        .await)
}
