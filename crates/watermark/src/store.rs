//! Durable cell holding the last-run watermark.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::lease::RunLease;
use crate::model::{LoadedWatermark, Watermark, WatermarkOrigin};

/// On-disk record: `{ "lastRun": "2024-01-01T10:00:00Z" }`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatermarkRecord {
    last_run: Watermark,
}

/// Persists a single watermark between runs.
pub trait WatermarkStore: Send + Sync {
    /// Raw read. `Ok(None)` when nothing has been persisted yet.
    fn read(&self) -> Result<Option<Watermark>, StoreError>;

    /// Overwrite the persisted watermark.
    fn save(&self, watermark: Watermark) -> Result<(), StoreError>;

    /// Take the exclusive run lease, if this store supports one.
    fn acquire_lease(
        &self,
        _ttl: Duration,
        _now: DateTime<Utc>,
    ) -> Result<Option<RunLease>, StoreError> {
        Ok(None)
    }

    /// Read the watermark, never failing.
    ///
    /// Missing, unparseable, or unreadable state yields `now - lookback`
    /// and a warning.
    fn load(&self, now: DateTime<Utc>, lookback: Duration) -> LoadedWatermark {
        let reason = match self.read() {
            Ok(Some(value)) => {
                debug!(watermark = %value, "loaded stored watermark");
                return LoadedWatermark {
                    value,
                    origin: WatermarkOrigin::Stored,
                };
            }
            Ok(None) => "no watermark persisted".to_string(),
            Err(e) => e.to_string(),
        };

        let value = Watermark::lookback_from(now, lookback);
        warn!(
            reason = %reason,
            fallback = %value,
            lookback_secs = lookback.as_secs(),
            "watermark unavailable, using lookback default"
        );
        LoadedWatermark {
            value,
            origin: WatermarkOrigin::Defaulted { reason },
        }
    }
}

// ── File store ────────────────────────────────────────────────

/// JSON file store with write-then-rename replacement.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<state>.lock`, next to the state file.
    pub fn lease_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn tmp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "watermark".to_string());
        self.path.with_file_name(format!(".{file_name}.tmp"))
    }
}

pub(crate) fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))
        }
        _ => Ok(()),
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn read(&self) -> Result<Option<Watermark>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let record: WatermarkRecord =
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        Ok(Some(record.last_run))
    }

    /// Writes to a `.tmp` sibling first, then renames over the state file
    /// so a crash never leaves a half-written record in place.
    fn save(&self, watermark: Watermark) -> Result<(), StoreError> {
        ensure_parent(&self.path)?;

        let json = serde_json::to_string_pretty(&WatermarkRecord {
            last_run: watermark,
        })?;

        let tmp_path = self.tmp_path();
        let mut file = fs::File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;

        info!(watermark = %watermark, path = %self.path.display(), "watermark persisted");
        Ok(())
    }

    fn acquire_lease(
        &self,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RunLease>, StoreError> {
        RunLease::acquire(self.lease_path(), ttl, now).map(Some)
    }
}

// ── In-memory store ───────────────────────────────────────────

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    value: RwLock<Option<Watermark>>,
    saves: AtomicUsize,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(watermark: Watermark) -> Self {
        Self {
            value: RwLock::new(Some(watermark)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Current value without going through the trait.
    pub fn get(&self) -> Option<Watermark> {
        *self.value.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn read(&self) -> Result<Option<Watermark>, StoreError> {
        Ok(self.get())
    }

    fn save(&self, watermark: Watermark) -> Result<(), StoreError> {
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = Some(watermark);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
