//! Per-symbol trailing stop persistence.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::filters::TrailingStopState;

/// Storage for trailing stop state. Loads never fail: anything unreadable
/// comes back as the reset state.
#[async_trait]
pub trait TrailingStateStore: Send + Sync {
    async fn load(&self, symbol: &str) -> TrailingStopState;

    async fn save(&self, symbol: &str, state: &TrailingStopState);
}

/// All symbols in one JSON object, `{ "BTC/USDT:USDT": { ... } }`.
pub struct JsonStateStore {
    path: PathBuf,
    // serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> BTreeMap<String, Value> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read trailing state");
                return BTreeMap::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt trailing state file, starting fresh");
                BTreeMap::new()
            }
        }
    }

    async fn write_all(&self, map: &BTreeMap<String, Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TrailingStateStore for JsonStateStore {
    async fn load(&self, symbol: &str) -> TrailingStopState {
        let _guard = self.lock.lock().await;
        let Some(record) = self.read_all().await.remove(symbol) else {
            return TrailingStopState::default();
        };

        match serde_json::from_value::<TrailingStopState>(record) {
            Ok(state) => state.normalized(),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Corrupt trailing state record, resetting");
                TrailingStopState::default()
            }
        }
    }

    async fn save(&self, symbol: &str, state: &TrailingStopState) {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await;

        let record = match serde_json::to_value(state) {
            Ok(record) => record,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Failed to encode trailing state");
                return;
            }
        };
        map.insert(symbol.to_string(), record);

        match self.write_all(&map).await {
            Ok(()) => debug!(symbol = %symbol, active = state.active, "Trailing state saved"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to save trailing state"),
        }
    }
}

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<String, TrailingStopState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrailingStateStore for MemoryStateStore {
    async fn load(&self, symbol: &str) -> TrailingStopState {
        self.states
            .lock()
            .await
            .get(symbol)
            .copied()
            .unwrap_or_default()
    }

    async fn save(&self, symbol: &str, state: &TrailingStopState) {
        self.states.lock().await.insert(symbol.to_string(), *state);
    }
}
