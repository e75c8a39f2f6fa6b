//! Table and JSON rendering of listings and batch results.

use facet::Facet;

use crate::addresses::InterfaceAddresses;
use crate::batch::{BatchResult, Outcome};
use crate::hypervisor::DomainInfo;
use crate::progress;
use crate::snapshot::SnapshotInfo;

// ── JSON output structs ─────────────────────────────────────────────

#[derive(Facet)]
struct DomainJson {
    name: String,
    state: String,
    /// Guest clock, UTC.
    time: Option<String>,
}

#[derive(Facet)]
struct InterfaceJson {
    domain: String,
    mac: String,
    names: Vec<String>,
    ipv4: Vec<String>,
    ipv6: Vec<String>,
}

#[derive(Facet)]
struct SnapshotJson {
    domain: String,
    name: String,
    current: bool,
    state: Option<String>,
    created: Option<i64>,
    description: Option<String>,
}

#[derive(Facet)]
struct OutcomeJson {
    vm: String,
    status: String,
    detail: String,
    /// Error kind for failed and skipped domains.
    error: Option<String>,
}

#[derive(Facet)]
struct BatchJson {
    operation: String,
    succeeded: bool,
    total: usize,
    failed: usize,
    skipped: usize,
    outcomes: Vec<OutcomeJson>,
}

// ── Domains ─────────────────────────────────────────────────────────

/// `times` holds the guest clock of each domain, in the same order.
pub fn domains_json(domains: &[DomainInfo], times: &[Option<i64>]) -> String {
    let rows: Vec<DomainJson> = domains
        .iter()
        .zip(times)
        .map(|(d, time)| DomainJson {
            name: d.name.clone(),
            state: d.state.label().to_string(),
            time: time.map(format_epoch),
        })
        .collect();
    facet_json::to_string(&rows).expect("JSON serialization")
}

pub fn domains_table(domains: &[DomainInfo], times: &[Option<i64>]) -> String {
    let rows = domains
        .iter()
        .zip(times)
        .map(|(d, time)| {
            vec![
                d.name.clone(),
                d.state.label().to_string(),
                time.map(format_epoch).unwrap_or_default(),
            ]
        })
        .collect();
    table(&["NAME", "STATE", "TIME"], rows)
}

// ── Addresses ───────────────────────────────────────────────────────

pub fn addresses_json(interfaces: &[InterfaceAddresses]) -> String {
    let rows: Vec<InterfaceJson> = interfaces
        .iter()
        .map(|i| InterfaceJson {
            domain: i.domain.clone(),
            mac: i.mac.clone(),
            names: i.names.clone(),
            ipv4: i.ipv4.clone(),
            ipv6: i.ipv6.clone(),
        })
        .collect();
    facet_json::to_string(&rows).expect("JSON serialization")
}

pub fn addresses_table(interfaces: &[InterfaceAddresses]) -> String {
    let rows = interfaces
        .iter()
        .map(|i| {
            vec![
                i.domain.clone(),
                i.mac.clone(),
                i.names.join(", "),
                i.ipv4.join(", "),
                i.ipv6.join(", "),
            ]
        })
        .collect();
    table(&["DOMAIN", "MAC", "INTERFACE", "IPV4", "IPV6"], rows)
}

// ── Snapshots ───────────────────────────────────────────────────────

pub fn snapshots_json(snapshots: &[SnapshotInfo]) -> String {
    let rows: Vec<SnapshotJson> = snapshots
        .iter()
        .map(|s| SnapshotJson {
            domain: s.domain.clone(),
            name: s.name.clone(),
            current: s.current,
            state: s.state.clone(),
            created: s.created,
            description: s.description.clone(),
        })
        .collect();
    facet_json::to_string(&rows).expect("JSON serialization")
}

pub fn snapshots_table(snapshots: &[SnapshotInfo]) -> String {
    let rows = snapshots
        .iter()
        .map(|s| {
            vec![
                s.domain.clone(),
                s.name.clone(),
                if s.current { "*".into() } else { String::new() },
                s.state.clone().unwrap_or_default(),
                s.created.map(format_epoch).unwrap_or_default(),
                s.description.clone().unwrap_or_default(),
            ]
        })
        .collect();
    table(
        &["DOMAIN", "SNAPSHOT", "CURRENT", "STATE", "CREATED", "DESCRIPTION"],
        rows,
    )
}

// ── Batches ─────────────────────────────────────────────────────────

pub fn batch_json(batch: &BatchResult) -> String {
    let summary = batch.summary();
    let outcomes = batch
        .outcomes()
        .iter()
        .map(|o| OutcomeJson {
            vm: o.vm.clone(),
            status: o.outcome.status().to_string(),
            detail: o.outcome.detail(),
            error: match &o.outcome {
                Outcome::Succeeded(_) => None,
                Outcome::Failed(e) | Outcome::Skipped(e) => Some(e.kind().to_string()),
            },
        })
        .collect();
    facet_json::to_string(&BatchJson {
        operation: batch.operation().label().to_string(),
        succeeded: batch.succeeded(),
        total: batch.len(),
        failed: summary.failed,
        skipped: summary.skipped,
        outcomes,
    })
    .expect("JSON serialization")
}

/// Closing line of a batch, e.g. `start: 3 succeeded, 1 failed`.
pub fn batch_summary(batch: &BatchResult) -> String {
    let summary = batch.summary();
    let mut line = format!("{}: {} succeeded", batch.operation().label(), summary.succeeded);
    if summary.failed > 0 {
        line.push_str(&format!(", {} failed", summary.failed));
    }
    if summary.skipped > 0 {
        line.push_str(&format!(", {} skipped", summary.skipped));
    }
    line
}

/// Lines for every domain that did not succeed.
pub fn batch_failures(batch: &BatchResult) -> Vec<String> {
    batch
        .outcomes()
        .iter()
        .filter(|o| !o.outcome.is_success())
        .map(progress::plain_line)
        .collect()
}

// ── Helpers ─────────────────────────────────────────────────────────

fn table(header: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    let mut out = String::new();
    for row in std::iter::once(header).chain(rows) {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Format a unix timestamp as `YYYY-MM-DD HH:MM:SS` (UTC).
fn format_epoch(secs: i64) -> String {
    let days = secs.div_euclid(86400);
    let time_of_day = secs.rem_euclid(86400);
    let (hours, minutes, seconds) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);

    // Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = z.div_euclid(146097);
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe + era * 400 + i64::from(m <= 2);

    format!("{y:04}-{m:02}-{d:02} {hours:02}:{minutes:02}:{seconds:02}")
}
