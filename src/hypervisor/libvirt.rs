//! libvirt connector built on the `virt` bindings.
//!
//! A `virConnectPtr` is thread safe, so every worker calls through the same
//! handle concurrently. Failed calls are classified against the connection's
//! liveness: an error on a dead connection means the handle needs replacing.

use std::time::{SystemTime, UNIX_EPOCH};

use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;
use virt::error as virt_error;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use super::{
    AddressSource, Connector, DeleteReport, DesiredState, DomainInfo, GuestInterface, Hypervisor,
    HypervisorError, PowerState,
};
use crate::domain_xml::{self, DiskVolume};
use crate::snapshot::{self, SnapshotInfo, SnapshotState};

/// Everything libvirt keeps next to a domain definition goes with it.
const UNDEFINE_FLAGS: sys::virDomainUndefineFlagsValues = sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE
    | sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA
    | sys::VIR_DOMAIN_UNDEFINE_CHECKPOINTS_METADATA
    | sys::VIR_DOMAIN_UNDEFINE_NVRAM;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

pub struct LibvirtConnector;

impl Connector for LibvirtConnector {
    type Handle = LibvirtHypervisor;

    fn open(&self, target: Option<&str>) -> Result<LibvirtHypervisor, HypervisorError> {
        // Suppress libvirt's default handler printing every error to stderr;
        // errors are surfaced through the returned Results instead.
        virt_error::clear_error_callback();

        let conn = Connect::open(target)
            .map_err(|e| HypervisorError::Failed(format!("failed to connect to libvirt: {e}")))?;
        tracing::debug!(uri = target.unwrap_or("default"), "connected to libvirt");
        Ok(LibvirtHypervisor {
            conn: ConnGuard(conn),
        })
    }
}

pub struct LibvirtHypervisor {
    conn: ConnGuard,
}

impl LibvirtHypervisor {
    /// Run `f` with the connection, classifying any libvirt error.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connect) -> Result<T, virt_error::Error>,
    ) -> Result<T, HypervisorError> {
        f(&self.conn).map_err(|e| self.classify(e))
    }

    fn with_domain<T>(
        &self,
        vm: &str,
        f: impl FnOnce(&Domain) -> Result<T, virt_error::Error>,
    ) -> Result<T, HypervisorError> {
        let dom = match Domain::lookup_by_name(&self.conn, vm) {
            Ok(dom) => dom,
            Err(e) if self.is_alive() => {
                tracing::debug!(vm, "domain lookup failed: {e}");
                return Err(HypervisorError::NoDomain(vm.to_string()));
            }
            Err(e) => return Err(HypervisorError::ConnectionLost(e.to_string())),
        };
        f(&dom).map_err(|e| self.classify(e))
    }

    fn is_alive(&self) -> bool {
        self.conn.is_alive().unwrap_or(false)
    }

    /// A failed call on a dead connection means the handle needs replacing.
    fn classify(&self, e: virt_error::Error) -> HypervisorError {
        if self.is_alive() {
            HypervisorError::Failed(e.to_string())
        } else {
            HypervisorError::ConnectionLost(e.to_string())
        }
    }

    /// The libvirt volume behind a disk, or why it cannot be removed.
    fn lookup_volume(&self, vm: &str, disk: &DiskVolume) -> Result<StorageVol, String> {
        match &disk.pool {
            Some(pool) => {
                let pool = StoragePool::lookup_by_name(&self.conn, pool).map_err(|_| {
                    format!("storage pool {pool} not found for disk {} of {vm}", disk.target)
                })?;
                StorageVol::lookup_by_name(&pool, &disk.source).map_err(|_| {
                    format!(
                        "storage volume {} not found for disk {} of {vm}",
                        disk.source, disk.target
                    )
                })
            }
            None => StorageVol::lookup_by_path(&self.conn, &disk.source).map_err(|_| {
                format!(
                    "storage volume {} of {vm} not managed by libvirt, delete manually",
                    disk.source
                )
            }),
        }
    }
}

fn power_state(state: sys::virDomainState) -> PowerState {
    match state {
        sys::VIR_DOMAIN_RUNNING => PowerState::Running,
        sys::VIR_DOMAIN_PAUSED => PowerState::Paused,
        sys::VIR_DOMAIN_SHUTOFF => PowerState::Shutoff,
        _ => PowerState::Undefined,
    }
}

fn address_source(source: AddressSource) -> sys::virDomainInterfaceAddressesSource {
    match source {
        AddressSource::Lease => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE,
        AddressSource::Agent => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT,
        AddressSource::Arp => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_ARP,
    }
}

fn snapshot_names(dom: &Domain) -> Result<Vec<String>, virt_error::Error> {
    dom.list_all_snapshots(0)?
        .iter()
        .map(DomainSnapshot::get_name)
        .collect()
}

impl Hypervisor for LibvirtHypervisor {
    fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
        self.with_conn(|conn| {
            conn.list_all_domains(0)?
                .iter()
                .map(|dom| -> Result<DomainInfo, virt_error::Error> {
                    let (state, _reason) = dom.get_state()?;
                    Ok(DomainInfo::new(dom.get_name()?, power_state(state)))
                })
                .collect()
        })
    }

    fn domain_state(&self, vm: &str) -> Result<PowerState, HypervisorError> {
        self.with_domain(vm, |dom| {
            let (state, _reason) = dom.get_state()?;
            Ok(power_state(state))
        })
    }

    fn set_power_state(&self, vm: &str, desired: DesiredState) -> Result<(), HypervisorError> {
        self.with_domain(vm, |dom| {
            match desired {
                DesiredState::Running => {
                    let (state, _) = dom.get_state()?;
                    if state == sys::VIR_DOMAIN_PAUSED {
                        dom.resume()?;
                    } else {
                        dom.create()?;
                    }
                }
                DesiredState::Paused => {
                    dom.suspend()?;
                }
                DesiredState::Shutoff { force: true } => {
                    dom.destroy()?;
                }
                DesiredState::Shutoff { force: false } => {
                    dom.shutdown()?;
                }
            }
            Ok(())
        })
    }

    fn snapshot_create(
        &self,
        vm: &str,
        name: &str,
        description: &str,
    ) -> Result<(), HypervisorError> {
        let xml = snapshot::snapshot_xml(name, description);
        self.with_domain(vm, |dom| {
            DomainSnapshot::create_xml(dom, &xml, 0)?;
            Ok(())
        })
    }

    fn snapshot_revert(&self, vm: &str, name: &str) -> Result<(), HypervisorError> {
        self.with_domain(vm, |dom| {
            let snap = DomainSnapshot::lookup_by_name(dom, name, 0)?;
            snap.revert(0)?;
            Ok(())
        })
    }

    fn snapshot_delete(&self, vm: &str, name: &str) -> Result<(), HypervisorError> {
        self.with_domain(vm, |dom| {
            let snap = DomainSnapshot::lookup_by_name(dom, name, 0)?;
            snap.delete(0)?;
            Ok(())
        })
    }

    fn snapshot_state(&self, vm: &str, name: &str) -> Result<SnapshotState, HypervisorError> {
        self.with_domain(vm, |dom| {
            let present = snapshot_names(dom)?.iter().any(|n| n == name);
            Ok(if present {
                SnapshotState::Present
            } else {
                SnapshotState::Absent
            })
        })
    }

    fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>, HypervisorError> {
        self.with_domain(vm, |dom| {
            let mut infos = Vec::new();
            for snap in dom.list_all_snapshots(0)? {
                let name = snap.get_name()?;
                let desc = snap
                    .get_xml_desc(0)
                    .map(|xml| snapshot::parse_snapshot_desc(&xml))
                    .unwrap_or_default();
                infos.push(SnapshotInfo {
                    domain: vm.to_string(),
                    name,
                    current: snap.is_current(0).unwrap_or(false),
                    state: desc.state,
                    created: desc.creation_time,
                    description: desc.description,
                });
            }
            Ok(infos)
        })
    }

    fn set_time(&self, vm: &str, now: SystemTime) -> Result<(), HypervisorError> {
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        self.with_domain(vm, |dom| {
            dom.set_time(
                since_epoch.as_secs() as i64,
                since_epoch.subsec_nanos() as i32,
                0,
            )?;
            Ok(())
        })
    }

    fn guest_time(&self, vm: &str) -> Result<i64, HypervisorError> {
        self.with_domain(vm, |dom| {
            let (seconds, _nanos) = dom.get_time(0)?;
            Ok(seconds)
        })
    }

    fn interface_addresses(
        &self,
        vm: &str,
        source: AddressSource,
    ) -> Result<Vec<GuestInterface>, HypervisorError> {
        self.with_domain(vm, |dom| {
            Ok(dom
                .interface_addresses(address_source(source), 0)?
                .into_iter()
                .map(|iface| GuestInterface {
                    name: iface.name,
                    hwaddr: iface.hwaddr,
                    addrs: iface.addrs.into_iter().map(|a| a.addr).collect(),
                })
                .collect())
        })
    }

    fn delete_domain(&self, vm: &str) -> Result<DeleteReport, HypervisorError> {
        self.with_domain(vm, |dom| {
            let mut report = DeleteReport::default();
            if dom.is_active()? {
                dom.destroy()?;
                report.stopped = true;
            }

            let disks = domain_xml::disk_volumes(vm, &dom.get_xml_desc(0)?).unwrap_or_else(|e| {
                let mut skipped = domain_xml::DiskVolumes::default();
                skipped.warnings.push(e);
                skipped
            });
            report.warnings = disks.warnings;
            let mut volumes = Vec::new();
            for disk in disks.volumes {
                match self.lookup_volume(vm, &disk) {
                    Ok(vol) => volumes.push((disk, vol)),
                    Err(message) => report.warnings.push(message),
                }
            }

            dom.undefine_flags(UNDEFINE_FLAGS)?;

            for (disk, vol) in volumes {
                match vol.delete(0) {
                    Ok(()) => report.volumes.push(disk.source),
                    Err(e) => report.warnings.push(format!(
                        "failed to delete volume {} ({}): {e}",
                        disk.target, disk.source
                    )),
                }
            }
            Ok(report)
        })
    }
}
