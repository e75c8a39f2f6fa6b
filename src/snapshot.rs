//! Snapshot state tracking and the libvirt `<domainsnapshot>` XML model.
//!
//! A snapshot is identified by `(vm, name)`. Its state is always queried
//! from the hypervisor right before acting on it, then checked against the
//! transition rules below.

use facet::Facet;

use crate::error::VmsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Absent,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAction {
    Create,
    Revert,
    Delete,
}

/// Apply `action` to a snapshot in `state`, returning the resulting state.
///
/// Create never overwrites an existing snapshot; revert and delete need one.
pub fn transition(state: SnapshotState, action: SnapshotAction) -> Result<SnapshotState, VmsError> {
    use SnapshotAction::*;
    use SnapshotState::*;

    match (state, action) {
        (Absent, Create) => Ok(Present),
        (Present, Create) => Err(VmsError::invalid_state("snapshot already exists")),
        (Present, Revert) => Ok(Present),
        (Absent, Revert) => Err(VmsError::invalid_state("no snapshot to revert to")),
        (Present, Delete) => Ok(Absent),
        (Absent, Delete) => Err(VmsError::invalid_state("no snapshot to delete")),
    }
}

/// One snapshot of a domain, as shown by `snapshot list`.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct SnapshotInfo {
    pub domain: String,
    pub name: String,
    pub current: bool,
    /// Domain state captured by the snapshot (`running`, `shutoff`, ...).
    pub state: Option<String>,
    /// Seconds since the epoch.
    pub created: Option<i64>,
    pub description: Option<String>,
}

// ── XML model ──────────────────────────────────────────────

#[derive(Debug, Facet)]
#[facet(rename = "domainsnapshot")]
struct SnapshotDef {
    name: String,
    description: Option<String>,
}

/// The subset of a snapshot's XML description we read back.
#[derive(Debug, Default, Facet)]
#[facet(rename = "domainsnapshot")]
#[facet(default)]
pub(crate) struct SnapshotDesc {
    pub(crate) name: Option<String>,
    pub(crate) state: Option<String>,
    #[facet(rename = "creationTime")]
    pub(crate) creation_time: Option<i64>,
    pub(crate) description: Option<String>,
}

/// Build the XML passed to `virDomainSnapshotCreateXML`.
pub fn snapshot_xml(name: &str, description: &str) -> String {
    let def = SnapshotDef {
        name: name.into(),
        description: (!description.is_empty()).then(|| description.to_string()),
    };
    facet_xml::to_string(&def).expect("snapshot XML serialization should not fail")
}

/// Parse the interesting fields of a snapshot XML description. Unparseable
/// descriptions yield an empty result rather than failing the listing.
pub(crate) fn parse_snapshot_desc(xml: &str) -> SnapshotDesc {
    match facet_xml::from_str::<SnapshotDesc>(xml) {
        Ok(desc) => desc,
        Err(e) => {
            tracing::debug!("could not parse snapshot XML: {e}");
            SnapshotDesc::default()
        }
    }
}
