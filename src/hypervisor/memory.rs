//! In-memory hypervisor for tests, with failure injection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use super::{
    AddressSource, Connector, DeleteReport, DesiredState, DomainInfo, GuestInterface, Hypervisor,
    HypervisorError, PowerState,
};
use crate::snapshot::{SnapshotInfo, SnapshotState};

#[derive(Default)]
struct World {
    domains: Vec<DomainInfo>,
    snapshots: HashMap<String, Vec<String>>,
    /// Domain name → error message returned by any call touching it.
    failing: HashMap<String, String>,
    /// Calls on these domains sever the connection (once each).
    severing: HashSet<String>,
    /// Like `severing`, but the call takes effect before the connection drops.
    severing_after: HashSet<String>,
    volumes: HashMap<String, Vec<String>>,
    interfaces: HashMap<(String, &'static str), Vec<GuestInterface>>,
    guest_clocks: HashMap<String, i64>,
    delays: HashMap<String, Duration>,
    /// Connections older than this generation are dead.
    alive_from: u64,
    generation: u64,
    refuse: bool,
    opens: usize,
    calls: Vec<String>,
    clock_set: Vec<String>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryConnector {
    world: Arc<Mutex<World>>,
    live: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

pub(crate) struct MemoryHypervisor {
    world: Arc<Mutex<World>>,
    generation: u64,
    live: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub(crate) fn with_domains(names: &[&str]) -> Self {
        let connector = Self::default();
        {
            let mut world = connector.world.lock().unwrap();
            world.domains = names
                .iter()
                .map(|n| DomainInfo::new(*n, PowerState::Shutoff))
                .collect();
        }
        connector
    }

    pub(crate) fn set_state(&self, vm: &str, state: PowerState) {
        let mut world = self.world.lock().unwrap();
        if let Some(d) = world.domains.iter_mut().find(|d| d.name == vm) {
            d.state = state;
        }
    }

    pub(crate) fn state(&self, vm: &str) -> Option<PowerState> {
        let world = self.world.lock().unwrap();
        world.domains.iter().find(|d| d.name == vm).map(|d| d.state)
    }

    pub(crate) fn add_snapshot(&self, vm: &str, name: &str) {
        let mut world = self.world.lock().unwrap();
        world
            .snapshots
            .entry(vm.to_string())
            .or_default()
            .push(name.to_string());
    }

    pub(crate) fn snapshots(&self, vm: &str) -> Vec<String> {
        let world = self.world.lock().unwrap();
        world.snapshots.get(vm).cloned().unwrap_or_default()
    }

    pub(crate) fn fail_on(&self, vm: &str, message: &str) {
        let mut world = self.world.lock().unwrap();
        world.failing.insert(vm.to_string(), message.to_string());
    }

    pub(crate) fn sever_on(&self, vm: &str) {
        self.world.lock().unwrap().severing.insert(vm.to_string());
    }

    /// The next mutating call on `vm` is applied, then the connection drops
    /// before the caller hears back.
    pub(crate) fn sever_after(&self, vm: &str) {
        self.world.lock().unwrap().severing_after.insert(vm.to_string());
    }

    pub(crate) fn add_volume(&self, vm: &str, path: &str) {
        let mut world = self.world.lock().unwrap();
        world
            .volumes
            .entry(vm.to_string())
            .or_default()
            .push(path.to_string());
    }

    pub(crate) fn add_interface(&self, vm: &str, source: AddressSource, iface: GuestInterface) {
        let mut world = self.world.lock().unwrap();
        world
            .interfaces
            .entry((vm.to_string(), source_key(source)))
            .or_default()
            .push(iface);
    }

    pub(crate) fn set_guest_clock(&self, vm: &str, seconds: i64) {
        self.world.lock().unwrap().guest_clocks.insert(vm.to_string(), seconds);
    }

    pub(crate) fn delay(&self, vm: &str, delay: Duration) {
        self.world.lock().unwrap().delays.insert(vm.to_string(), delay);
    }

    /// Kill every open connection.
    pub(crate) fn sever(&self) {
        let mut world = self.world.lock().unwrap();
        world.alive_from = world.generation + 1;
    }

    pub(crate) fn refuse_connections(&self) {
        self.world.lock().unwrap().refuse = true;
    }

    pub(crate) fn open_count(&self) -> usize {
        self.world.lock().unwrap().opens
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of domain operations observed running at once.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Domain operations performed, as `op:vm`, in call order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.world.lock().unwrap().calls.clone()
    }

    pub(crate) fn clock_set(&self) -> Vec<String> {
        self.world.lock().unwrap().clock_set.clone()
    }
}

fn source_key(source: AddressSource) -> &'static str {
    match source {
        AddressSource::Lease => "lease",
        AddressSource::Agent => "agent",
        AddressSource::Arp => "arp",
    }
}

impl Connector for MemoryConnector {
    type Handle = MemoryHypervisor;

    fn open(&self, _target: Option<&str>) -> Result<MemoryHypervisor, HypervisorError> {
        let mut world = self.world.lock().unwrap();
        if world.refuse {
            return Err(HypervisorError::Failed("connection refused".into()));
        }
        world.opens += 1;
        world.generation += 1;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryHypervisor {
            world: self.world.clone(),
            generation: world.generation,
            live: self.live.clone(),
            in_flight: self.in_flight.clone(),
            peak: self.peak.clone(),
        })
    }
}

impl Drop for MemoryHypervisor {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryHypervisor {
    fn check_alive(&self, world: &World) -> Result<(), HypervisorError> {
        if self.generation < world.alive_from {
            return Err(HypervisorError::ConnectionLost("handle closed".into()));
        }
        Ok(())
    }

    /// Common prologue for domain operations: liveness, injected failures,
    /// artificial latency.
    fn enter(&self, op: &str, vm: &str) -> Result<(), HypervisorError> {
        let delay = {
            let mut world = self.world.lock().unwrap();
            self.check_alive(&world)?;
            if world.severing.remove(vm) {
                world.alive_from = world.generation + 1;
                return Err(HypervisorError::ConnectionLost("connection reset".into()));
            }
            if let Some(message) = world.failing.get(vm) {
                return Err(HypervisorError::Failed(message.clone()));
            }
            if !world.domains.iter().any(|d| d.name == vm) {
                return Err(HypervisorError::NoDomain(vm.to_string()));
            }
            world.calls.push(format!("{op}:{vm}"));
            world.delays.get(vm).copied()
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Epilogue for mutating calls that already took effect.
    fn leave(&self, world: &mut World, vm: &str) -> Result<(), HypervisorError> {
        if world.severing_after.remove(vm) {
            world.alive_from = world.generation + 1;
            return Err(HypervisorError::ConnectionLost("connection reset".into()));
        }
        Ok(())
    }

    /// Prologue for read-only queries on one domain.
    fn query(&self, world: &World, vm: &str) -> Result<(), HypervisorError> {
        self.check_alive(world)?;
        if let Some(message) = world.failing.get(vm) {
            return Err(HypervisorError::Failed(message.clone()));
        }
        if !world.domains.iter().any(|d| d.name == vm) {
            return Err(HypervisorError::NoDomain(vm.to_string()));
        }
        Ok(())
    }
}

impl Hypervisor for MemoryHypervisor {
    fn list_domains(&self) -> Result<Vec<DomainInfo>, HypervisorError> {
        let world = self.world.lock().unwrap();
        self.check_alive(&world)?;
        Ok(world.domains.clone())
    }

    fn set_power_state(&self, vm: &str, desired: DesiredState) -> Result<(), HypervisorError> {
        self.enter("power", vm)?;
        let mut world = self.world.lock().unwrap();
        let dom = world
            .domains
            .iter_mut()
            .find(|d| d.name == vm)
            .ok_or_else(|| HypervisorError::NoDomain(vm.to_string()))?;
        dom.state = match desired {
            DesiredState::Running => PowerState::Running,
            DesiredState::Paused => PowerState::Paused,
            DesiredState::Shutoff { .. } => PowerState::Shutoff,
        };
        self.leave(&mut world, vm)
    }

    fn domain_state(&self, vm: &str) -> Result<PowerState, HypervisorError> {
        let world = self.world.lock().unwrap();
        self.query(&world, vm)?;
        world
            .domains
            .iter()
            .find(|d| d.name == vm)
            .map(|d| d.state)
            .ok_or_else(|| HypervisorError::NoDomain(vm.to_string()))
    }

    fn snapshot_create(&self, vm: &str, name: &str, _description: &str) -> Result<(), HypervisorError> {
        self.enter("snapshot-create", vm)?;
        let mut world = self.world.lock().unwrap();
        let snaps = world.snapshots.entry(vm.to_string()).or_default();
        if snaps.iter().any(|s| s == name) {
            return Err(HypervisorError::Failed(format!("snapshot '{name}' exists")));
        }
        snaps.push(name.to_string());
        self.leave(&mut world, vm)
    }

    fn snapshot_revert(&self, vm: &str, name: &str) -> Result<(), HypervisorError> {
        self.enter("snapshot-revert", vm)?;
        let world = self.world.lock().unwrap();
        match world.snapshots.get(vm) {
            Some(snaps) if snaps.iter().any(|s| s == name) => Ok(()),
            _ => Err(HypervisorError::Failed(format!("no snapshot '{name}'"))),
        }
    }

    fn snapshot_delete(&self, vm: &str, name: &str) -> Result<(), HypervisorError> {
        self.enter("snapshot-delete", vm)?;
        let mut world = self.world.lock().unwrap();
        let snaps = world.snapshots.entry(vm.to_string()).or_default();
        let before = snaps.len();
        snaps.retain(|s| s != name);
        if snaps.len() == before {
            return Err(HypervisorError::Failed(format!("no snapshot '{name}'")));
        }
        self.leave(&mut world, vm)
    }

    fn snapshot_state(&self, vm: &str, name: &str) -> Result<SnapshotState, HypervisorError> {
        let world = self.world.lock().unwrap();
        self.query(&world, vm)?;
        let present = world
            .snapshots
            .get(vm)
            .is_some_and(|snaps| snaps.iter().any(|s| s == name));
        Ok(if present {
            SnapshotState::Present
        } else {
            SnapshotState::Absent
        })
    }

    fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>, HypervisorError> {
        let world = self.world.lock().unwrap();
        self.query(&world, vm)?;
        let snaps = world.snapshots.get(vm).cloned().unwrap_or_default();
        let last = snaps.len().saturating_sub(1);
        Ok(snaps
            .into_iter()
            .enumerate()
            .map(|(i, name)| SnapshotInfo {
                domain: vm.to_string(),
                name,
                current: i == last,
                state: Some("running".into()),
                created: None,
                description: None,
            })
            .collect())
    }

    fn set_time(&self, vm: &str, _now: SystemTime) -> Result<(), HypervisorError> {
        self.enter("set-time", vm)?;
        self.world.lock().unwrap().clock_set.push(vm.to_string());
        Ok(())
    }

    fn guest_time(&self, vm: &str) -> Result<i64, HypervisorError> {
        let world = self.world.lock().unwrap();
        self.query(&world, vm)?;
        world
            .guest_clocks
            .get(vm)
            .copied()
            .ok_or_else(|| HypervisorError::Failed("guest agent is not responding".into()))
    }

    fn interface_addresses(
        &self,
        vm: &str,
        source: AddressSource,
    ) -> Result<Vec<GuestInterface>, HypervisorError> {
        let world = self.world.lock().unwrap();
        self.query(&world, vm)?;
        if source == AddressSource::Agent && !world.guest_clocks.contains_key(vm) {
            return Err(HypervisorError::Failed("guest agent is not responding".into()));
        }
        Ok(world
            .interfaces
            .get(&(vm.to_string(), source_key(source)))
            .cloned()
            .unwrap_or_default())
    }

    fn delete_domain(&self, vm: &str) -> Result<DeleteReport, HypervisorError> {
        self.enter("delete", vm)?;
        let mut world = self.world.lock().unwrap();
        let mut report = DeleteReport::default();
        if let Some(pos) = world.domains.iter().position(|d| d.name == vm) {
            let dom = world.domains.remove(pos);
            report.stopped = matches!(dom.state, PowerState::Running | PowerState::Paused);
        }
        world.snapshots.remove(vm);
        report.volumes = world.volumes.remove(vm).unwrap_or_default();
        self.leave(&mut world, vm)?;
        Ok(report)
    }
}
