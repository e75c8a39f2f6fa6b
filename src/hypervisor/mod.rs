//! Boundary with the hypervisor.
//!
//! The orchestration core only talks to a hypervisor through the
//! [`Connector`] / [`Hypervisor`] pair. Every call is blocking from the
//! caller's point of view; the dispatcher moves them onto the blocking pool.

pub mod libvirt;

#[cfg(test)]
pub(crate) mod memory;

use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

use crate::snapshot::{SnapshotInfo, SnapshotState};

/// Lifecycle state of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Paused,
    Shutoff,
    /// Anything the core has no transition rules for (crashed, blocked,
    /// pm-suspended, shutting down, ...).
    Undefined,
}

impl PowerState {
    pub fn label(self) -> &'static str {
        match self {
            PowerState::Running => "running",
            PowerState::Paused => "paused",
            PowerState::Shutoff => "stopped",
            PowerState::Undefined => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Target state for [`Hypervisor::set_power_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    /// Boot a stopped domain or resume a paused one.
    Running,
    Paused,
    /// `force` powers the domain off instead of asking the guest to shut down.
    Shutoff { force: bool },
}

/// A domain as seen in one listing: name plus the state at listing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub name: String,
    pub state: PowerState,
}

impl DomainInfo {
    pub fn new(name: impl Into<String>, state: PowerState) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }
}

/// Where [`Hypervisor::interface_addresses`] looks for guest addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    /// DHCP leases of libvirt-managed networks.
    Lease,
    /// The guest agent. Fails when no agent runs in the guest.
    Agent,
    /// The host ARP table.
    Arp,
}

impl AddressSource {
    pub const ALL: [AddressSource; 3] = [
        AddressSource::Lease,
        AddressSource::Agent,
        AddressSource::Arp,
    ];
}

/// A guest NIC as reported by one address source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInterface {
    pub name: String,
    pub hwaddr: String,
    pub addrs: Vec<String>,
}

/// What [`Hypervisor::delete_domain`] did besides undefining the domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// The domain was active and had to be destroyed first.
    pub stopped: bool,
    /// Storage volumes removed with the domain.
    pub volumes: Vec<String>,
    /// Storage left behind, as messages for the user.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Error)]
pub enum HypervisorError {
    /// The handle is no longer usable; a fresh connection is needed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("domain '{0}' not found")]
    NoDomain(String),

    #[error("{0}")]
    Failed(String),
}

/// Opens handles to a connection target.
pub trait Connector: Send + Sync + 'static {
    type Handle: Hypervisor;

    /// Open a new handle. `target` of `None` lets the hypervisor pick its default URI.
    fn open(&self, target: Option<&str>) -> Result<Self::Handle, HypervisorError>;
}

/// An open connection, shared by the dispatcher's workers.
///
/// Dropping the handle releases the underlying connection.
pub trait Hypervisor: Send + Sync + 'static {
    /// All defined domains, in the hypervisor's listing order.
    fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError>;

    /// Current state of one domain.
    fn domain_state(&self, vm: &str) -> Result<PowerState, HypervisorError>;

    fn set_power_state(&self, vm: &str, desired: DesiredState) -> Result<(), HypervisorError>;

    fn snapshot_create(
        &self,
        vm: &str,
        name: &str,
        description: &str,
    ) -> Result<(), HypervisorError>;

    fn snapshot_revert(&self, vm: &str, name: &str) -> Result<(), HypervisorError>;

    fn snapshot_delete(&self, vm: &str, name: &str) -> Result<(), HypervisorError>;

    fn snapshot_state(&self, vm: &str, name: &str) -> Result<SnapshotState, HypervisorError>;

    fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>, HypervisorError>;

    /// Set the guest wall clock. Requires a guest agent in the domain.
    fn set_time(&self, vm: &str, now: SystemTime) -> Result<(), HypervisorError>;

    /// Guest wall clock in seconds since the epoch. Requires a guest agent.
    fn guest_time(&self, vm: &str) -> Result<i64, HypervisorError>;

    fn interface_addresses(
        &self,
        vm: &str,
        source: AddressSource,
    ) -> Result<Vec<GuestInterface>, HypervisorError>;

    /// Destroy the domain if active, undefine it with its managed save,
    /// snapshot and checkpoint metadata and NVRAM, then delete the storage
    /// volumes libvirt knows about.
    fn delete_domain(&self, vm: &str) -> Result<DeleteReport, HypervisorError>;
}
