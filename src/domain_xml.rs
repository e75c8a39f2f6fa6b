//! The disk section of a libvirt domain XML description, read when a domain
//! is deleted to find the storage volumes backing it.

use facet::Facet;
use facet_xml as xml;

// ── XML model structs ──────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(rename = "domain")]
#[facet(default)]
struct DomainDef {
    devices: Devices,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Devices {
    #[facet(xml::elements, rename = "disk")]
    disks: Vec<Disk>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Disk {
    source: Option<DiskSource>,
    target: Option<DiskTarget>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct DiskSource {
    #[facet(xml::attribute)]
    file: Option<String>,
    #[facet(xml::attribute)]
    dir: Option<String>,
    #[facet(xml::attribute)]
    name: Option<String>,
    #[facet(xml::attribute)]
    dev: Option<String>,
    #[facet(xml::attribute)]
    volume: Option<String>,
    #[facet(xml::attribute)]
    pool: Option<String>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct DiskTarget {
    #[facet(xml::attribute)]
    dev: Option<String>,
}

// ── public API ─────────────────────────────────────────────

/// Where a disk's storage lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskVolume {
    /// Guest device name, e.g. `vda`.
    pub target: String,
    /// Volume name inside `pool`, or a host path when there is no pool.
    pub source: String,
    pub pool: Option<String>,
}

/// Disks of a domain description.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiskVolumes {
    pub volumes: Vec<DiskVolume>,
    /// Disks that were skipped, as messages for the user.
    pub warnings: Vec<String>,
}

/// Find the storage behind every disk of `vm` from its XML description.
///
/// Disks without a source (empty cdrom drives) are ignored, as are sources
/// naming more than one location, such as network disks.
pub fn disk_volumes(vm: &str, domain_xml: &str) -> Result<DiskVolumes, String> {
    let def: DomainDef = facet_xml::from_str(domain_xml)
        .map_err(|e| format!("cannot read the XML description of {vm}: {e}"))?;

    let mut found = DiskVolumes::default();
    for disk in def.devices.disks {
        let Some(target) = disk.target.and_then(|t| t.dev) else {
            found
                .warnings
                .push(format!("missing target in disk definition of {vm}"));
            continue;
        };
        let Some(source) = disk.source else {
            continue;
        };
        let mut locations = [
            source.file,
            source.dir,
            source.name,
            source.dev,
            source.volume,
        ]
        .into_iter()
        .flatten();
        let (Some(location), None) = (locations.next(), locations.next()) else {
            continue;
        };
        found.volumes.push(DiskVolume {
            target,
            source: location,
            pool: source.pool,
        });
    }
    Ok(found)
}
