//! Output formatters for command results.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{Cell, Table};

use chanq_core::{LeaseToken, QueueStats, QueuedRecord, ReclaimReport};
use chanq_proto::ChannelBinding;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// One row of `chanq status`.
pub struct ChannelStatus<'a> {
    pub binding: &'a ChannelBinding,
    pub stats: QueueStats,
}

/// One row of `chanq peek`.
pub struct PeekEntry {
    pub record: QueuedRecord,
    pub lease: Option<LeaseToken>,
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format the channel bindings.
    fn format_bindings(&self, bindings: &[&ChannelBinding]) -> String;

    /// Format per-channel queue counts.
    fn format_status(&self, rows: &[ChannelStatus<'_>]) -> String;

    /// Format queued records, oldest first.
    fn format_records(&self, entries: &[PeekEntry], now: u64) -> String;

    /// Format the outcome of a reclaim sweep.
    fn format_reclaim(&self, report: &ReclaimReport) -> String;

    /// Format the sequence number of an enqueued record.
    fn format_enqueued(&self, channel: &str, seq: u64) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_bindings(&self, bindings: &[&ChannelBinding]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Channel", "Entity", "Locked"]);
        for binding in bindings {
            table.add_row(vec![
                Cell::new(&binding.name),
                Cell::new(&binding.entity_type),
                Cell::new(if binding.lock_required { "yes" } else { "no" }),
            ]);
        }
        format!("{}\n{} channel(s)", table, bindings.len())
    }

    fn format_status(&self, rows: &[ChannelStatus<'_>]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Channel", "Locked", "Queued", "Leased", "Expired", "Available"]);
        for row in rows {
            table.add_row(vec![
                Cell::new(&row.binding.name),
                Cell::new(if row.binding.lock_required { "yes" } else { "no" }),
                Cell::new(row.stats.queued),
                Cell::new(row.stats.leased),
                Cell::new(row.stats.expired_leases),
                Cell::new(row.stats.available()),
            ]);
        }
        table.to_string()
    }

    fn format_records(&self, entries: &[PeekEntry], now: u64) -> String {
        if entries.is_empty() {
            return "No queued records".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Seq", "Entity", "Key", "Op", "Enqueued", "Lease"]);
        for entry in entries {
            let record = &entry.record.record;
            table.add_row(vec![
                Cell::new(entry.record.seq),
                Cell::new(&record.entity_type),
                Cell::new(&record.primary_key),
                Cell::new(record.operation),
                Cell::new(format_timestamp(record.timestamp)),
                Cell::new(format_lease(entry.lease.as_ref(), now)),
            ]);
        }
        format!("{}\n{} record(s)", table, entries.len())
    }

    fn format_reclaim(&self, report: &ReclaimReport) -> String {
        format!(
            "{} lease(s) reclaimed, {} orphan(s) removed across {} locked channel(s)",
            report.leases_reclaimed, report.orphans_removed, report.channels_scanned
        )
    }

    fn format_enqueued(&self, channel: &str, seq: u64) -> String {
        format!("enqueued on {} as #{}", channel, seq)
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_bindings(&self, bindings: &[&ChannelBinding]) -> String {
        serde_json::to_string_pretty(bindings).unwrap_or_else(|_| "[]".to_string())
    }

    fn format_status(&self, rows: &[ChannelStatus<'_>]) -> String {
        let rows: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "channel": row.binding.name,
                    "entity_type": row.binding.entity_type,
                    "lock_required": row.binding.lock_required,
                    "queued": row.stats.queued,
                    "leased": row.stats.leased,
                    "expired_leases": row.stats.expired_leases,
                    "available": row.stats.available(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
    }

    fn format_records(&self, entries: &[PeekEntry], now: u64) -> String {
        let rows: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                let lease = entry.lease.as_ref().map(|lease| {
                    serde_json::json!({
                        "holder": lease.holder,
                        "expires_at": lease.expires_at,
                        "live": lease.is_live(now),
                    })
                });
                serde_json::json!({
                    "seq": entry.record.seq,
                    "channel": entry.record.channel,
                    "record": entry.record.record,
                    "lease": lease,
                })
            })
            .collect();
        serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
    }

    fn format_reclaim(&self, report: &ReclaimReport) -> String {
        serde_json::json!({
            "channels_scanned": report.channels_scanned,
            "leases_reclaimed": report.leases_reclaimed,
            "orphans_removed": report.orphans_removed,
        })
        .to_string()
    }

    fn format_enqueued(&self, channel: &str, seq: u64) -> String {
        serde_json::json!({
            "channel": channel,
            "seq": seq,
        })
        .to_string()
    }
}

/// Format a microsecond timestamp as UTC.
fn format_timestamp(micros: u64) -> String {
    match DateTime::<Utc>::from_timestamp_micros(micros as i64) {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => micros.to_string(),
    }
}

fn format_lease(lease: Option<&LeaseToken>, now: u64) -> String {
    match lease {
        None => "-".to_string(),
        Some(lease) if lease.is_live(now) => {
            let remaining_ms = (lease.expires_at - now) / 1_000;
            format!("{} ({}ms left)", lease.holder, remaining_ms)
        }
        Some(lease) => format!("{} (expired)", lease.holder),
    }
}
