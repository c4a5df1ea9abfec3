//! Command execution against a local store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use chanq_core::{
    BindingRegistry, LockCoordinator, NotificationQueue, NotificationStore, StoreConfig, VisibilityMode,
};
use chanq_proto::{current_timestamp, ChangeRecord, Operation};

use crate::formatter::{ChannelStatus, Formatter, PeekEntry};

/// Errors from executing a command.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("{0}")]
    Core(#[from] chanq_core::Error),

    #[error("invalid operation '{0}', expected insert, update or delete")]
    Operation(String),
}

/// Bindings and store paths for one invocation.
pub struct Context {
    pub bindings_path: PathBuf,
    pub data_path: PathBuf,
}

impl Context {
    /// Load the bindings file.
    pub fn registry(&self) -> Result<BindingRegistry, ExecuteError> {
        Ok(BindingRegistry::from_json_file(&self.bindings_path)?)
    }

    fn open(&self) -> Result<(Arc<BindingRegistry>, Arc<NotificationStore>), ExecuteError> {
        let registry = Arc::new(self.registry()?);
        let store = Arc::new(open_store(&self.data_path)?);
        Ok((registry, store))
    }
}

fn open_store(path: &Path) -> Result<NotificationStore, chanq_core::Error> {
    tracing::debug!(path = %path.display(), "opening store");
    NotificationStore::open(&StoreConfig::new(path))
}

/// Check that the bindings file loads, and list it.
pub fn validate_bindings(ctx: &Context, formatter: &dyn Formatter) -> Result<String, ExecuteError> {
    let registry = ctx.registry()?;
    let bindings: Vec<_> = registry.iter().collect();
    Ok(formatter.format_bindings(&bindings))
}

/// Enqueue one change record.
pub fn enqueue(
    ctx: &Context,
    formatter: &dyn Formatter,
    entity_type: &str,
    primary_key: &str,
    operation: &str,
    old: Option<String>,
    new: Option<String>,
) -> Result<String, ExecuteError> {
    let operation: Operation = operation
        .parse()
        .map_err(|_| ExecuteError::Operation(operation.to_string()))?;

    let (registry, store) = ctx.open()?;
    let channel = registry.resolve(entity_type)?.name.clone();
    let queue = NotificationQueue::new(store, registry);

    let mut record = ChangeRecord::new(entity_type, primary_key, operation);
    record.old = old;
    record.new = new;
    let seq = queue.enqueue(record)?;
    queue.flush()?;

    Ok(formatter.format_enqueued(&channel, seq))
}

/// Queue counts for one channel or all of them.
pub fn status(ctx: &Context, formatter: &dyn Formatter, channel: Option<&str>) -> Result<String, ExecuteError> {
    let (registry, store) = ctx.open()?;
    let queue = NotificationQueue::new(store, registry.clone());
    let now = current_timestamp();

    let bindings = match channel {
        Some(name) => vec![registry.channel(name)?],
        None => registry.iter().collect(),
    };

    let mut rows = Vec::with_capacity(bindings.len());
    for binding in bindings {
        rows.push(ChannelStatus {
            binding,
            stats: queue.stats_at(&binding.name, now)?,
        });
    }
    Ok(formatter.format_status(&rows))
}

/// Show the oldest records on a channel without consuming them.
pub fn peek(ctx: &Context, formatter: &dyn Formatter, channel: &str, limit: usize) -> Result<String, ExecuteError> {
    let (registry, store) = ctx.open()?;
    let queue = NotificationQueue::new(store.clone(), registry.clone());
    let locks = LockCoordinator::new(store, registry, Default::default());
    let now = current_timestamp();

    let mut entries = Vec::new();
    for record in queue.dequeue_batch(channel, limit, VisibilityMode::All)? {
        let record = record?;
        let lease = locks.lease(channel, record.seq)?;
        entries.push(PeekEntry { record, lease });
    }
    Ok(formatter.format_records(&entries, now))
}

/// Run one lease reclaim sweep.
pub fn reclaim(ctx: &Context, formatter: &dyn Formatter) -> Result<String, ExecuteError> {
    let (registry, store) = ctx.open()?;
    let locks = LockCoordinator::new(store.clone(), registry, Default::default());
    let report = locks.reclaim_expired()?;
    store.flush()?;
    Ok(formatter.format_reclaim(&report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::JsonFormatter;

    const BINDINGS: &str = r#"{
        "channels": [
            {"name": "nix_channel_channel", "entity_type": "NixChannel"},
            {"name": "cve_record_channel", "entity_type": "CveRecord", "lock_required": true}
        ]
    }"#;

    fn context(dir: &tempfile::TempDir) -> Context {
        let bindings_path = dir.path().join("bindings.json");
        std::fs::write(&bindings_path, BINDINGS).unwrap();
        Context {
            bindings_path,
            data_path: dir.path().join("data"),
        }
    }

    #[test]
    fn test_enqueue_then_status_and_peek() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        let out = enqueue(&ctx, &JsonFormatter, "CveRecord", "CVE-1", "insert", None, Some("{}".into())).unwrap();
        let enqueued: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(enqueued["channel"], "cve_record_channel");

        let out = status(&ctx, &JsonFormatter, Some("cve_record_channel")).unwrap();
        let rows: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(rows[0]["queued"], 1);

        let out = peek(&ctx, &JsonFormatter, "cve_record_channel", 10).unwrap();
        let records: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(records[0]["record"]["primary_key"], "CVE-1");
        assert!(records[0]["lease"].is_null());
    }

    #[test]
    fn test_bad_operation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let err = enqueue(&ctx, &JsonFormatter, "NixChannel", "x", "upsert", None, None).unwrap_err();
        assert!(matches!(err, ExecuteError::Operation(op) if op == "upsert"));
    }

    #[test]
    fn test_unknown_entity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let err = enqueue(&ctx, &JsonFormatter, "User", "1", "delete", None, None).unwrap_err();
        assert!(matches!(err, ExecuteError::Core(chanq_core::Error::UnknownEntity(_))));
    }

    #[test]
    fn test_reclaim_on_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let out = reclaim(&ctx, &JsonFormatter).unwrap();
        let report: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(report["channels_scanned"], 1);
        assert_eq!(report["leases_reclaimed"], 0);
    }
}
