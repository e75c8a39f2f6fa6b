//! Guest network addresses, merged across the sources libvirt can ask:
//! DHCP leases, the guest agent and the host ARP table.

use std::collections::BTreeSet;

use crate::hypervisor::GuestInterface;

/// Loopback is reported by the guest agent and never interesting.
const LOOPBACK: &str = "lo";

/// One NIC of a domain, keyed by MAC address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddresses {
    pub domain: String,
    pub mac: String,
    /// Names the sources used for this NIC (`vnet3` from the host side,
    /// `eth0` from the guest agent), `eth*` first, then `vnet*`.
    pub names: Vec<String>,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

/// Merge the interfaces reported by each source into one entry per MAC, in
/// order of first appearance. Names and addresses are deduplicated.
pub fn merge<I>(domain: &str, sources: I) -> Vec<InterfaceAddresses>
where
    I: IntoIterator<Item = Vec<GuestInterface>>,
{
    let mut merged: Vec<(String, BTreeSet<String>, BTreeSet<String>)> = Vec::new();
    for iface in sources.into_iter().flatten() {
        if iface.name == LOOPBACK {
            continue;
        }
        let idx = match merged.iter().position(|(mac, ..)| *mac == iface.hwaddr) {
            Some(idx) => idx,
            None => {
                merged.push((iface.hwaddr.clone(), BTreeSet::new(), BTreeSet::new()));
                merged.len() - 1
            }
        };
        let (_, names, addrs) = &mut merged[idx];
        names.insert(iface.name);
        addrs.extend(iface.addrs);
    }

    merged
        .into_iter()
        .map(|(mac, names, addrs)| {
            let mut names: Vec<String> = names.into_iter().collect();
            names.sort_by_key(|n| name_rank(n));
            let (ipv6, ipv4): (Vec<String>, Vec<String>) =
                addrs.into_iter().partition(|a| a.contains(':'));
            InterfaceAddresses {
                domain: domain.to_string(),
                mac,
                names,
                ipv4,
                ipv6,
            }
        })
        .collect()
}

fn name_rank(name: &str) -> usize {
    match name.trim_end_matches(|c: char| c.is_ascii_digit()) {
        "eth" => 0,
        "vnet" => 1,
        _ => 2,
    }
}
