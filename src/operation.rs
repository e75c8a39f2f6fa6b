//! Operation kinds and their mapping onto hypervisor calls.

use std::time::SystemTime;

use crate::connection::{Attempt, CallError};
use crate::error::VmsError;
use crate::hypervisor::{
    DeleteReport, DesiredState, DomainInfo, Hypervisor, HypervisorError, PowerState,
};
use crate::selector;
use crate::snapshot::{self, SnapshotAction, SnapshotState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Start,
    Stop { force: bool },
    Pause,
    Resume,
    /// Undefine the domain and remove its storage.
    Delete,
    SnapshotCreate { name: String, description: String },
    SnapshotRevert { name: String },
    /// `name` may be a glob, deleting every matching snapshot.
    SnapshotDelete { name: String },
    SyncTime,
}

impl OperationKind {
    /// Stable name of the operation, as accepted on the command line.
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Start => "start",
            OperationKind::Stop { .. } => "stop",
            OperationKind::Pause => "pause",
            OperationKind::Resume => "resume",
            OperationKind::Delete => "delete",
            OperationKind::SnapshotCreate { .. } => "snapshot-create",
            OperationKind::SnapshotRevert { .. } => "snapshot-revert",
            OperationKind::SnapshotDelete { .. } => "snapshot-delete",
            OperationKind::SyncTime => "synctime",
        }
    }

    /// Progress line shown while the batch runs.
    pub fn progress_message(&self) -> &'static str {
        match self {
            OperationKind::Start => "Starting domains",
            OperationKind::Stop { force: true } => "Powering off domains",
            OperationKind::Stop { force: false } => "Stopping domains",
            OperationKind::Pause => "Pausing domains",
            OperationKind::Resume => "Resuming domains",
            OperationKind::Delete => "Deleting domains",
            OperationKind::SnapshotCreate { .. } => "Creating snapshots",
            OperationKind::SnapshotRevert { .. } => "Reverting snapshots",
            OperationKind::SnapshotDelete { .. } => "Deleting snapshots",
            OperationKind::SyncTime => "Synchronizing time on domains",
        }
    }

    /// Reject arguments that would fail on every domain.
    pub fn validate(&self) -> Result<(), VmsError> {
        if let OperationKind::SnapshotDelete { name } = self
            && selector::is_glob(name)
        {
            selector::compile(name)?;
        }
        Ok(())
    }
}

/// One operation over a resolved set of domains. Immutable once built.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    kind: OperationKind,
    vms: Vec<DomainInfo>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, vms: Vec<DomainInfo>) -> Self {
        Self { kind, vms }
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn vms(&self) -> &[DomainInfo] {
        &self.vms
    }
}

/// What a successful per-domain operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Applied(String),
    /// The domain was already in the requested state.
    NoOp(String),
}

/// What a power operation does to a domain in a given state.
enum PowerPlan {
    Done(&'static str),
    Apply(DesiredState, &'static str),
}

fn power_plan(kind: &OperationKind, state: PowerState) -> Result<PowerPlan, VmsError> {
    use PowerPlan::*;

    Ok(match (kind, state) {
        (OperationKind::Start, PowerState::Running) => Done("already running"),
        (OperationKind::Start, PowerState::Paused) => Apply(DesiredState::Running, "resumed"),
        (OperationKind::Start, _) => Apply(DesiredState::Running, "started"),
        (OperationKind::Stop { .. }, PowerState::Shutoff) => Done("already stopped"),
        (OperationKind::Stop { force: true }, _) => {
            Apply(DesiredState::Shutoff { force: true }, "powered off")
        }
        (OperationKind::Stop { force: false }, _) => {
            Apply(DesiredState::Shutoff { force: false }, "shutdown triggered")
        }
        (OperationKind::Pause, PowerState::Paused) => Done("already paused"),
        (OperationKind::Pause, PowerState::Running) => Apply(DesiredState::Paused, "paused"),
        (OperationKind::Pause, other) => {
            return Err(VmsError::invalid_state(format!("cannot pause a {other} domain")));
        }
        (OperationKind::Resume, PowerState::Running) => Done("already running"),
        (OperationKind::Resume, PowerState::Paused) => Apply(DesiredState::Running, "resumed"),
        (OperationKind::Resume, other) => {
            return Err(VmsError::invalid_state(format!("cannot resume a {other} domain")));
        }
        (other, _) => {
            return Err(VmsError::Operation {
                message: format!("{} is not a power operation", other.label()),
            });
        }
    })
}

/// Perform `kind` on one domain. Blocking.
///
/// Power operations decide from the state captured in the batch listing;
/// snapshot operations query the snapshot state right before acting. On a
/// [`Attempt::Retry`] the first try may already have taken effect, so the
/// current state is read again and a change found done counts as applied.
pub fn execute<H: Hypervisor + ?Sized>(
    kind: &OperationKind,
    hv: &H,
    vm: &DomainInfo,
    attempt: Attempt,
) -> Result<Completion, CallError> {
    let name = vm.name.as_str();
    let retry = attempt == Attempt::Retry;
    match kind {
        OperationKind::Start
        | OperationKind::Stop { .. }
        | OperationKind::Pause
        | OperationKind::Resume => {
            let (desired, message) = match power_plan(kind, vm.state)? {
                PowerPlan::Done(message) => return Ok(Completion::NoOp(message.into())),
                PowerPlan::Apply(desired, message) => (desired, message),
            };
            let desired = if retry {
                match power_plan(kind, hv.domain_state(name)?)? {
                    PowerPlan::Done(_) => return Ok(Completion::Applied(message.into())),
                    PowerPlan::Apply(now, _) => now,
                }
            } else {
                desired
            };
            hv.set_power_state(name, desired)?;
            Ok(Completion::Applied(message.into()))
        }
        OperationKind::Delete => {
            let report = match hv.delete_domain(name) {
                Err(HypervisorError::NoDomain(_)) if retry => {
                    return Ok(Completion::Applied("deleted".into()));
                }
                result => result?,
            };
            for warning in &report.warnings {
                tracing::warn!(vm = name, "{warning}");
            }
            Ok(Completion::Applied(deleted_message(&report)))
        }
        OperationKind::SnapshotCreate { name: snap, description } => {
            let state = hv.snapshot_state(name, snap)?;
            if retry && state == SnapshotState::Present {
                return Ok(Completion::Applied(format!("created snapshot {snap}")));
            }
            snapshot::transition(state, SnapshotAction::Create)?;
            hv.snapshot_create(name, snap, description)?;
            Ok(Completion::Applied(format!("created snapshot {snap}")))
        }
        OperationKind::SnapshotRevert { name: snap } => {
            let state = hv.snapshot_state(name, snap)?;
            snapshot::transition(state, SnapshotAction::Revert)?;
            hv.snapshot_revert(name, snap)?;
            Ok(Completion::Applied(format!("reverted to snapshot {snap}")))
        }
        OperationKind::SnapshotDelete { name: pattern } if selector::is_glob(pattern) => {
            let glob = selector::compile(pattern)?;
            let matching: Vec<String> = hv
                .list_snapshots(name)?
                .into_iter()
                .map(|s| s.name)
                .filter(|n| glob.matches(n))
                .collect();
            if matching.is_empty() {
                if retry {
                    return Ok(Completion::Applied(format!(
                        "deleted snapshots matching {pattern}"
                    )));
                }
                return Err(VmsError::invalid_state("no snapshot to delete").into());
            }
            for snap in &matching {
                hv.snapshot_delete(name, snap)?;
            }
            Ok(Completion::Applied(format!("deleted snapshots {}", matching.join(", "))))
        }
        OperationKind::SnapshotDelete { name: snap } => {
            let state = hv.snapshot_state(name, snap)?;
            if retry && state == SnapshotState::Absent {
                return Ok(Completion::Applied(format!("deleted snapshot {snap}")));
            }
            snapshot::transition(state, SnapshotAction::Delete)?;
            hv.snapshot_delete(name, snap)?;
            Ok(Completion::Applied(format!("deleted snapshot {snap}")))
        }
        OperationKind::SyncTime => {
            if vm.state != PowerState::Running {
                return Ok(Completion::NoOp("not running".into()));
            }
            hv.set_time(name, SystemTime::now())?;
            Ok(Completion::Applied("time synchronized".into()))
        }
    }
}

/// `stopped and deleted, removed /var/lib/libvirt/images/web1.qcow2`
fn deleted_message(report: &DeleteReport) -> String {
    let mut message = if report.stopped {
        "stopped and deleted".to_string()
    } else {
        "deleted".to_string()
    };
    if !report.volumes.is_empty() {
        message.push_str(&format!(", removed {}", report.volumes.join(", ")));
    }
    for warning in &report.warnings {
        message.push_str(&format!("; {warning}"));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::Connector;
    use crate::hypervisor::memory::MemoryConnector;

    fn run(connector: &MemoryConnector, kind: OperationKind, vm: &str) -> Result<Completion, CallError> {
        let hv = connector.open(None).unwrap();
        let info = DomainInfo::new(vm, connector.state(vm).unwrap());
        execute(&kind, &hv, &info, Attempt::First)
    }

    #[test]
    fn start_running_is_noop() {
        let c = MemoryConnector::with_domains(&["a"]);
        c.set_state("a", PowerState::Running);
        assert_eq!(
            run(&c, OperationKind::Start, "a").unwrap(),
            Completion::NoOp("already running".into())
        );
        assert!(c.calls().is_empty());
    }

    #[test]
    fn start_paused_resumes() {
        let c = MemoryConnector::with_domains(&["a"]);
        c.set_state("a", PowerState::Paused);
        assert_eq!(
            run(&c, OperationKind::Start, "a").unwrap(),
            Completion::Applied("resumed".into())
        );
        assert_eq!(c.state("a"), Some(PowerState::Running));
    }

    #[test]
    fn stop_stopped_is_noop() {
        let c = MemoryConnector::with_domains(&["a"]);
        assert!(matches!(
            run(&c, OperationKind::Stop { force: true }, "a").unwrap(),
            Completion::NoOp(_)
        ));
    }

    #[test]
    fn pause_stopped_is_invalid() {
        let c = MemoryConnector::with_domains(&["a"]);
        let err = run(&c, OperationKind::Pause, "a").unwrap_err();
        assert!(matches!(err, CallError::Rejected(VmsError::InvalidState { .. })));
    }

    #[test]
    fn retry_counts_a_start_that_went_through() {
        let c = MemoryConnector::with_domains(&["a"]);
        let hv = c.open(None).unwrap();
        let listed = DomainInfo::new("a", PowerState::Shutoff);
        c.set_state("a", PowerState::Running);

        let done = execute(&OperationKind::Start, &hv, &listed, Attempt::Retry).unwrap();
        assert_eq!(done, Completion::Applied("started".into()));
        assert!(c.calls().is_empty());
    }

    #[test]
    fn retry_acts_on_the_current_state() {
        let c = MemoryConnector::with_domains(&["a"]);
        let hv = c.open(None).unwrap();
        let listed = DomainInfo::new("a", PowerState::Running);
        c.set_state("a", PowerState::Paused);

        let done = execute(&OperationKind::Stop { force: true }, &hv, &listed, Attempt::Retry).unwrap();
        assert_eq!(done, Completion::Applied("powered off".into()));
        assert_eq!(c.state("a"), Some(PowerState::Shutoff));
    }

    #[test]
    fn snapshot_create_checks_existing() {
        let c = MemoryConnector::with_domains(&["a"]);
        c.add_snapshot("a", "base");
        let kind = OperationKind::SnapshotCreate {
            name: "base".into(),
            description: String::new(),
        };
        let err = run(&c, kind, "a").unwrap_err();
        assert!(matches!(
            err,
            CallError::Rejected(VmsError::InvalidState { ref message }) if message == "snapshot already exists"
        ));
        assert!(c.calls().is_empty());
    }

    #[test]
    fn snapshot_delete_removes() {
        let c = MemoryConnector::with_domains(&["a"]);
        c.add_snapshot("a", "base");
        run(&c, OperationKind::SnapshotDelete { name: "base".into() }, "a").unwrap();
        assert!(c.snapshots("a").is_empty());
    }

    #[test]
    fn snapshot_delete_by_glob() {
        let c = MemoryConnector::with_domains(&["a"]);
        for snap in ["nightly-1", "keep", "nightly-2"] {
            c.add_snapshot("a", snap);
        }
        let done = run(&c, OperationKind::SnapshotDelete { name: "nightly-*".into() }, "a").unwrap();
        assert_eq!(done, Completion::Applied("deleted snapshots nightly-1, nightly-2".into()));
        assert_eq!(c.snapshots("a"), ["keep"]);

        let err = run(&c, OperationKind::SnapshotDelete { name: "nightly-*".into() }, "a").unwrap_err();
        assert!(matches!(
            err,
            CallError::Rejected(VmsError::InvalidState { ref message }) if message == "no snapshot to delete"
        ));
    }

    #[test]
    fn invalid_snapshot_glob_is_rejected_up_front() {
        let kind = OperationKind::SnapshotDelete { name: "snap[".into() };
        assert!(matches!(kind.validate(), Err(VmsError::InvalidPattern { .. })));
        assert!(OperationKind::SnapshotDelete { name: "snap".into() }.validate().is_ok());
    }

    #[test]
    fn delete_stops_and_removes_storage() {
        let c = MemoryConnector::with_domains(&["a", "b"]);
        c.set_state("a", PowerState::Running);
        c.add_snapshot("a", "base");
        c.add_volume("a", "/var/lib/libvirt/images/a.qcow2");

        let done = run(&c, OperationKind::Delete, "a").unwrap();
        assert_eq!(
            done,
            Completion::Applied("stopped and deleted, removed /var/lib/libvirt/images/a.qcow2".into())
        );
        assert_eq!(c.state("a"), None);
        assert!(c.snapshots("a").is_empty());
        assert_eq!(
            run(&c, OperationKind::Delete, "b").unwrap(),
            Completion::Applied("deleted".into())
        );
    }

    #[test]
    fn delete_message_lists_leftovers() {
        let report = DeleteReport {
            stopped: false,
            volumes: vec![],
            warnings: vec!["storage volume /srv/a.img of a not managed by libvirt, delete manually".into()],
        };
        assert_eq!(
            deleted_message(&report),
            "deleted; storage volume /srv/a.img of a not managed by libvirt, delete manually"
        );
    }

    #[test]
    fn synctime_skips_stopped_domains() {
        let c = MemoryConnector::with_domains(&["a", "b"]);
        c.set_state("b", PowerState::Running);
        assert!(matches!(run(&c, OperationKind::SyncTime, "a").unwrap(), Completion::NoOp(_)));
        assert!(matches!(run(&c, OperationKind::SyncTime, "b").unwrap(), Completion::Applied(_)));
        assert_eq!(c.clock_set(), ["b"]);
    }
}
