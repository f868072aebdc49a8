//! Exclusive run lease backed by a lock file.
//!
//! Two runs racing on load/plan/save could move the watermark backwards, so
//! a run takes the lease before touching the store and fails fast when it is
//! held. The lock file records its holder and an expiry:
//!
//! 1. Acquisition hard-links a fully written record into place; only one
//!    writer wins and the file is never seen half-written.
//! 2. If the file exists and has not expired, acquisition fails with
//!    [`StoreError::Locked`]. So does an unreadable file younger than
//!    `UNREADABLE_GRACE`.
//! 3. An expired lease, or an old unreadable file (a crashed run), is taken
//!    over by whoever creates the claim file for that exact lease first. The
//!    claimant renames its record over the stale one and reads it back.
//! 4. Dropping the [`RunLease`] removes the file if it still belongs to us.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::add_saturating;
use crate::store::ensure_parent;

/// Unreadable lease files younger than this belong to a holder still writing.
const UNREADABLE_GRACE: Duration = Duration::from_secs(30);

/// A takeover claim older than this was left by a crashed claimant.
const CLAIM_GRACE: Duration = Duration::from_secs(30);

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Guard for a held lease. Released on drop.
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
    info: LeaseInfo,
    released: bool,
}

impl RunLease {
    /// Take the lease at `path`, failing fast if another holder owns it.
    pub fn acquire(
        path: impl Into<PathBuf>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        ensure_parent(&path)?;

        let info = LeaseInfo {
            holder_id: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: add_saturating(now, ttl),
        };

        if try_create(&path, &info)? {
            return Ok(Self::held(path, info));
        }

        match inspect(&path, now)? {
            Existing::Gone => create_or_locked(path, info, now),
            Existing::Held {
                holder,
                expires_at,
            } => Err(StoreError::Locked { holder, expires_at }),
            Existing::Stale(stale) => take_over(path, info, stale, now),
        }
    }

    fn held(path: PathBuf, info: LeaseInfo) -> Self {
        debug!(path = %path.display(), holder = %info.holder_id, "run lease acquired");
        Self {
            path,
            info,
            released: false,
        }
    }

    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing any removal error.
    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> Result<(), StoreError> {
        match read_info(&self.path) {
            Ok(Some(current)) if current.holder_id != self.info.holder_id => {
                warn!(
                    path = %self.path.display(),
                    holder = %current.holder_id,
                    "run lease was taken over, leaving it in place"
                );
                return Ok(());
            }
            Ok(None) => return Ok(()),
            _ => {}
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "run lease released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove_if_owned() {
            warn!(error = %e, "failed to release run lease");
        }
    }
}

/// What currently sits at the lease path.
enum Existing {
    Gone,
    Held {
        holder: String,
        expires_at: DateTime<Utc>,
    },
    Stale(StaleLease),
}

/// Identity of a lock file that may be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StaleLease {
    Expired { holder_id: String },
    Unreadable { modified_nanos: u128 },
}

impl StaleLease {
    fn holder(&self) -> String {
        match self {
            Self::Expired { holder_id } => holder_id.clone(),
            Self::Unreadable { .. } => "unknown".to_string(),
        }
    }

    /// Name of the claim file guarding the replacement of this lease.
    fn claim_path(&self, lease_path: &Path) -> PathBuf {
        let key = match self {
            Self::Expired { holder_id } => holder_id.clone(),
            Self::Unreadable { modified_nanos } => format!("unreadable-{modified_nanos}"),
        };
        lease_path.with_file_name(format!("{}.{key}.claim", file_name(lease_path)))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lease".to_string())
}

fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default()
}

fn inspect(path: &Path, now: DateTime<Utc>) -> Result<Existing, StoreError> {
    let message = match read_info(path) {
        Ok(None) => return Ok(Existing::Gone),
        Ok(Some(existing)) if !existing.is_expired(now) => {
            return Ok(Existing::Held {
                holder: existing.holder_id,
                expires_at: existing.expires_at,
            })
        }
        Ok(Some(existing)) => {
            return Ok(Existing::Stale(StaleLease::Expired {
                holder_id: existing.holder_id,
            }))
        }
        Err(message) => message,
    };

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Existing::Gone),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let age = age_of(modified);
    if age < UNREADABLE_GRACE {
        debug!(
            path = %path.display(),
            error = %message,
            age_ms = age.as_millis() as u64,
            "unreadable run lease is recent, treating it as held"
        );
        return Ok(Existing::Held {
            holder: "unknown".to_string(),
            expires_at: add_saturating(now, UNREADABLE_GRACE - age),
        });
    }

    warn!(
        path = %path.display(),
        error = %message,
        "run lease is unreadable and old, taking it over"
    );
    let modified_nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    Ok(Existing::Stale(StaleLease::Unreadable { modified_nanos }))
}

/// The lease file vanished between attempts: one more exclusive create.
fn create_or_locked(
    path: PathBuf,
    info: LeaseInfo,
    now: DateTime<Utc>,
) -> Result<RunLease, StoreError> {
    if try_create(&path, &info)? {
        return Ok(RunLease::held(path, info));
    }
    Err(locked_by_current(&path, now))
}

/// Replace a stale lease.
///
/// Only the process that creates the claim file for this exact stale lease
/// may replace it. The claimant re-checks that the stale lease is still in
/// place, renames its own record over it, and reads the file back to confirm
/// it is the holder.
fn take_over(
    path: PathBuf,
    info: LeaseInfo,
    stale: StaleLease,
    now: DateTime<Utc>,
) -> Result<RunLease, StoreError> {
    let claim = stale.claim_path(&path);
    match OpenOptions::new().write(true).create_new(true).open(&claim) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            abandon_old_claim(&claim);
            return Err(StoreError::Locked {
                holder: stale.holder(),
                expires_at: now,
            });
        }
        Err(e) => return Err(StoreError::io(&claim, e)),
    }

    let result = replace_stale(path, info, &stale, now);
    if let Err(e) = fs::remove_file(&claim) {
        warn!(path = %claim.display(), error = %e, "failed to remove lease claim");
    }
    result
}

fn replace_stale(
    path: PathBuf,
    info: LeaseInfo,
    stale: &StaleLease,
    now: DateTime<Utc>,
) -> Result<RunLease, StoreError> {
    match inspect(&path, now)? {
        Existing::Stale(current) if &current == stale => {}
        Existing::Gone => return create_or_locked(path, info, now),
        Existing::Held {
            holder,
            expires_at,
        } => return Err(StoreError::Locked { holder, expires_at }),
        Existing::Stale(current) => {
            return Err(StoreError::Locked {
                holder: current.holder(),
                expires_at: now,
            })
        }
    }

    if let StaleLease::Expired { holder_id } = stale {
        warn!(path = %path.display(), holder = %holder_id, "taking over expired run lease");
    }

    let tmp = write_tmp(&path, &info)?;
    if let Err(e) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(&path, e));
    }

    match read_info(&path) {
        Ok(Some(current)) if current.holder_id == info.holder_id => Ok(RunLease::held(path, info)),
        Ok(Some(current)) => Err(StoreError::Locked {
            holder: current.holder_id,
            expires_at: current.expires_at,
        }),
        _ => Err(locked_by_current(&path, now)),
    }
}

/// Remove a claim left behind by a claimant that never finished.
fn abandon_old_claim(claim: &Path) {
    let Ok(modified) = fs::metadata(claim).and_then(|m| m.modified()) else {
        return;
    };
    if age_of(modified) >= CLAIM_GRACE {
        warn!(path = %claim.display(), "removing abandoned lease claim");
        let _ = fs::remove_file(claim);
    }
}

fn locked_by_current(path: &Path, now: DateTime<Utc>) -> StoreError {
    match read_info(path) {
        Ok(Some(current)) => StoreError::Locked {
            holder: current.holder_id,
            expires_at: current.expires_at,
        },
        _ => StoreError::Locked {
            holder: "unknown".to_string(),
            expires_at: now,
        },
    }
}

/// Fully written sibling file holding `info`.
fn write_tmp(path: &Path, info: &LeaseInfo) -> Result<PathBuf, StoreError> {
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name(path), info.holder_id));
    let json = serde_json::to_vec(info)?;
    let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(&json)
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::io(&tmp, e))?;
    Ok(tmp)
}

/// Publish `info` at `path` only if no lease file exists.
///
/// The record is written in full to a temporary file and hard-linked into
/// place, so the lease file is never observed empty. Returns `false` when a
/// lease file is already present.
fn try_create(path: &Path, info: &LeaseInfo) -> Result<bool, StoreError> {
    let tmp = write_tmp(path, info)?;
    let linked = fs::hard_link(&tmp, path);
    if let Err(e) = fs::remove_file(&tmp) {
        debug!(path = %tmp.display(), error = %e, "failed to remove lease temp file");
    }
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// `Ok(None)` when the file vanished, `Err` with a message when unreadable.
fn read_info(path: &Path) -> Result<Option<LeaseInfo>, String> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| e.to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}
