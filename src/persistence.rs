// =============================================================================
// Persistence — append-only event log + key/value store for strategy
// parameters and trading mode.
// =============================================================================
//
// SPEC_FULL.md §6 draws a hard boundary here: the persistent relational store
// is an external collaborator and out of scope; only the interface the core
// consumes is specified. This module implements exactly that interface and
// nothing more — no schema, no query language, no migrations. The event log
// is a newline-delimited JSON file, appended to and never rewritten; the
// key/value store reuses the same atomic tmp+rename JSON write the runtime
// config uses.
//
// =============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Severity of an appended event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// A single append-only event-log entry (SPEC_FULL.md §3 "Trade record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: chrono::DateTime<Utc>,
    pub level: LogLevel,
    pub event_type: String,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct KvStore {
    strategy_params: HashMap<String, f64>,
    trading_mode: Option<String>,
}

/// Append-only event log plus small key/value store, backing C4 of the
/// component table.
pub struct Persistence {
    log_path: PathBuf,
    kv_path: PathBuf,
    kv: RwLock<KvStore>,
}

impl Persistence {
    /// Open (or create) the persistence layer rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create persistence dir {}", dir.display()))?;

        let log_path = dir.join("events.ndjson");
        let kv_path = dir.join("kv_store.json");

        let kv = if kv_path.exists() {
            let content = std::fs::read_to_string(&kv_path)
                .with_context(|| format!("failed to read kv store {}", kv_path.display()))?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            KvStore::default()
        };

        Ok(Self {
            log_path,
            kv_path,
            kv: RwLock::new(kv),
        })
    }

    /// Append one event to the log. Never fails the caller's operation if the
    /// write itself fails — logged and swallowed, matching the append-only,
    /// best-effort nature of diagnostic logging.
    pub fn log_event(&self, level: LogLevel, event_type: &str, detail: Value) {
        let record = EventRecord {
            timestamp: Utc::now(),
            level,
            event_type: event_type.to_string(),
            detail,
        };

        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialise event record");
                return;
            }
        };

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| writeln!(f, "{}", line));

        if let Err(e) = result {
            warn!(error = %e, path = %self.log_path.display(), "failed to append event log");
        }
    }

    /// Read the last `limit` events, optionally filtered by level.
    pub fn get_events(&self, limit: usize, level: Option<LogLevel>) -> Vec<EventRecord> {
        let content = match std::fs::read_to_string(&self.log_path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut records: Vec<EventRecord> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|r: &EventRecord| match level {
                Some(lv) => r.level == lv,
                None => true,
            })
            .collect();

        records.reverse();
        records.truncate(limit);
        records
    }

    pub fn get_strategy_param(&self, name: &str) -> Option<f64> {
        self.kv.read().strategy_params.get(name).copied()
    }

    pub fn set_strategy_param(
        &self,
        name: &str,
        value: f64,
        prev: Option<f64>,
        reason: Option<&str>,
    ) -> Result<()> {
        {
            let mut kv = self.kv.write();
            kv.strategy_params.insert(name.to_string(), value);
        }
        self.flush_kv()?;

        self.log_event(
            LogLevel::Info,
            "STRATEGY_PARAM_UPDATED",
            serde_json::json!({
                "name": name,
                "value": value,
                "prev": prev,
                "reason": reason,
            }),
        );
        Ok(())
    }

    pub fn get_trading_mode(&self) -> Option<String> {
        self.kv.read().trading_mode.clone()
    }

    pub fn set_trading_mode(&self, mode: &str) -> Result<()> {
        {
            let mut kv = self.kv.write();
            kv.trading_mode = Some(mode.to_string());
        }
        self.flush_kv()
    }

    fn flush_kv(&self) -> Result<()> {
        let content = {
            let kv = self.kv.read();
            serde_json::to_string_pretty(&*kv).context("failed to serialise kv store")?
        };

        let tmp_path = self.kv_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp kv store {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.kv_path)
            .with_context(|| format!("failed to rename tmp kv store {}", self.kv_path.display()))?;

        info!(path = %self.kv_path.display(), "kv store saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("etf-signal-agent-test-{name}-{}", uuid::Uuid::new_v4()));
        dir
    }

    #[test]
    fn log_event_then_read_back() {
        let dir = temp_dir("log");
        let p = Persistence::open(&dir).unwrap();
        p.log_event(LogLevel::Info, "DUPLICATE_BLOCKED", serde_json::json!({"kind": "crash_day"}));
        p.log_event(LogLevel::Critical, "REVERSAL_PARTIAL_FAILURE", serde_json::json!({}));

        let events = p.get_events(10, None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "REVERSAL_PARTIAL_FAILURE");

        let critical_only = p.get_events(10, Some(LogLevel::Critical));
        assert_eq!(critical_only.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn strategy_param_roundtrip_survives_reopen() {
        let dir = temp_dir("kv");
        {
            let p = Persistence::open(&dir).unwrap();
            p.set_strategy_param("crash_day_threshold", -1.8, Some(-1.5), Some("operator tuning"))
                .unwrap();
        }
        let p2 = Persistence::open(&dir).unwrap();
        assert_eq!(p2.get_strategy_param("crash_day_threshold"), Some(-1.8));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn trading_mode_defaults_to_none() {
        let dir = temp_dir("mode");
        let p = Persistence::open(&dir).unwrap();
        assert_eq!(p.get_trading_mode(), None);
        p.set_trading_mode("paper").unwrap();
        assert_eq!(p.get_trading_mode(), Some("paper".to_string()));

        std::fs::remove_dir_all(&dir).ok();
    }
}
