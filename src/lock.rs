//! Workspace lease: serializes exclusive index-mutating sessions
//!
//! The lease is a JSON PID file next to the store. At most one live
//! process holds it per workspace. A lease is stale (reclaimable) when
//! its pid is not running, or when the recorded process start time does
//! not match the live process with that pid — a recycled pid fails the
//! second check.
//!
//! The lease is advisory and single-host: PID liveness does not travel
//! across machines, so it is not safe over network filesystems.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::error::{RepoFactsError, Result};
use crate::paths;
use crate::schema::LeaseInfo;

/// Legacy heartbeat lock directories older than this are deleted outright
/// before PID-file acquisition, so format upgrades never deadlock.
const LEGACY_LOCK_MAX_AGE: Duration = Duration::from_secs(30);

/// Knobs for lease acquisition polling
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            poll_interval_ms: 100,
        }
    }
}

/// Handle to a held workspace lease.
///
/// Dropping the handle releases the lease best-effort; call `release`
/// for an error-checked release.
#[derive(Debug)]
pub struct WorkspaceLock {
    lease_path: PathBuf,
    info: LeaseInfo,
    released: bool,
}

impl WorkspaceLock {
    /// The lease contents as written to disk
    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// Delete the lease file if this handle still owns it.
    ///
    /// Idempotent: succeeds even if the file is already gone (e.g. another
    /// process reclaimed a lease we crashed on and later released it).
    /// A lease that no longer matches this handle's recorded info belongs
    /// to a newer claim (same-pid re-acquisition refreshes the file) and
    /// is left for that claim's handle to release.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_lease(&self.lease_path) {
            LeaseState::Held(current) if current == self.info => {
                match std::fs::remove_file(&self.lease_path) {
                    Ok(()) => {
                        debug!(path = %self.lease_path.display(), "lease released");
                        Ok(())
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            _ => {
                debug!(
                    path = %self.lease_path.display(),
                    "lease no longer ours, skipping delete"
                );
                Ok(())
            }
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Acquire the exclusive mutating lease for `workspace`.
///
/// - No lease present: claim immediately.
/// - Stale lease (dead pid, or pid-reuse mismatch): reclaim immediately.
/// - Our own pid already owns it: refresh and take over (re-entrant after
///   crash recovery).
/// - Live distinct owner: poll every `poll_interval_ms` until `timeout_ms`,
///   then fail `lease_conflict` carrying the owner's pid and start time.
pub fn acquire_workspace_lock(workspace: &Path, options: &AcquireOptions) -> Result<WorkspaceLock> {
    let dir = paths::store_dir(workspace);
    std::fs::create_dir_all(&dir)?;
    remove_legacy_lock_dir(&paths::legacy_lock_dir(workspace));

    let lease_path = paths::lease_path(workspace);
    let deadline = Instant::now() + Duration::from_millis(options.timeout_ms);
    let self_pid = std::process::id();

    loop {
        match read_lease(&lease_path) {
            LeaseState::Missing => {
                if let Some(lock) = try_claim(&lease_path, self_pid)? {
                    return Ok(lock);
                }
                // Lost the race; fall through to re-evaluate
            }
            LeaseState::Corrupt => {
                // Unreadable lease: treat as stale and clear it
                warn!(path = %lease_path.display(), "removing corrupt lease file");
                match std::fs::remove_file(&lease_path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                continue;
            }
            LeaseState::Held(existing) => {
                if existing.pid == self_pid {
                    // Re-entrant takeover: refresh our own lease in place
                    let info = lease_for(self_pid);
                    write_lease(&lease_path, &info)?;
                    info!(pid = self_pid, "refreshed own lease");
                    return Ok(WorkspaceLock {
                        lease_path,
                        info,
                        released: false,
                    });
                }

                if is_stale(&existing) {
                    warn!(
                        owner_pid = existing.pid,
                        "reclaiming stale lease from dead or recycled pid"
                    );
                    // Best-effort: another contender may reclaim it first
                    match std::fs::remove_file(&lease_path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                    continue;
                }

                if Instant::now() >= deadline {
                    return Err(RepoFactsError::LeaseConflict {
                        owner_pid: existing.pid,
                        owner_started_at: existing.started_at,
                        timeout_ms: options.timeout_ms,
                    });
                }
            }
        }

        std::thread::sleep(Duration::from_millis(options.poll_interval_ms));
        if Instant::now() >= deadline {
            // Final attempt so short timeouts still see a just-freed lease
            if matches!(read_lease(&lease_path), LeaseState::Missing) {
                if let Some(lock) = try_claim(&lease_path, self_pid)? {
                    return Ok(lock);
                }
            }
            if let LeaseState::Held(existing) = read_lease(&lease_path) {
                if existing.pid != self_pid && !is_stale(&existing) {
                    return Err(RepoFactsError::LeaseConflict {
                        owner_pid: existing.pid,
                        owner_started_at: existing.started_at,
                        timeout_ms: options.timeout_ms,
                    });
                }
            }
        }
    }
}

/// On-disk lease state as observed at one instant
enum LeaseState {
    Missing,
    Corrupt,
    Held(LeaseInfo),
}

/// A lease is stale when its pid is gone or its recorded process start
/// time mismatches the live process (pid reuse).
fn is_stale(lease: &LeaseInfo) -> bool {
    match process_start_time(lease.pid) {
        None => true,
        Some(live_start) => live_start != lease.process_started_at,
    }
}

/// OS-reported start time (seconds since epoch) for a pid, if running
pub(crate) fn process_start_time(pid: u32) -> Option<u64> {
    let sys_pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]));
    sys.process(sys_pid).map(|p| p.start_time())
}

fn lease_for(pid: u32) -> LeaseInfo {
    LeaseInfo {
        pid,
        started_at: chrono::Utc::now().to_rfc3339(),
        process_started_at: process_start_time(pid).unwrap_or(0),
    }
}

/// Claim the lease exclusively; None if someone beat us to it.
///
/// The payload is staged in a sibling file and hard-linked into place, so
/// the lease is never observable half-written: contenders see either no
/// file or complete JSON. The link itself fails if another claim landed
/// first.
fn try_claim(lease_path: &Path, pid: u32) -> Result<Option<WorkspaceLock>> {
    let info = lease_for(pid);
    let payload = serde_json::to_vec_pretty(&info)?;

    let staging = staging_path(lease_path, pid);
    std::fs::write(&staging, &payload)?;
    let outcome = std::fs::hard_link(&staging, lease_path);
    let _ = std::fs::remove_file(&staging);

    match outcome {
        Ok(()) => {
            info!(pid, path = %lease_path.display(), "lease acquired");
            Ok(Some(WorkspaceLock {
                lease_path: lease_path.to_path_buf(),
                info,
                released: false,
            }))
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Overwrite our own lease atomically (stage then rename)
fn write_lease(lease_path: &Path, info: &LeaseInfo) -> Result<()> {
    let payload = serde_json::to_vec_pretty(info)?;
    let staging = staging_path(lease_path, info.pid);
    std::fs::write(&staging, payload)?;
    std::fs::rename(&staging, lease_path)?;
    Ok(())
}

/// Per-pid staging file next to the lease
fn staging_path(lease_path: &Path, pid: u32) -> PathBuf {
    lease_path.with_extension(format!("lock.{}", pid))
}

fn read_lease(lease_path: &Path) -> LeaseState {
    match std::fs::read(lease_path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(info) => LeaseState::Held(info),
            Err(_) => LeaseState::Corrupt,
        },
        Err(_) => LeaseState::Missing,
    }
}

/// Delete an old-format heartbeat lock directory if it has gone quiet.
///
/// ENOENT and races with other upgraders are swallowed: this is
/// best-effort cleanup, not a correctness gate.
fn remove_legacy_lock_dir(dir: &Path) {
    let Ok(meta) = std::fs::metadata(dir) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let quiet = meta
        .modified()
        .ok()
        .and_then(|m| m.elapsed().ok())
        .map(|age| age > LEGACY_LOCK_MAX_AGE)
        .unwrap_or(true);
    if quiet {
        if let Err(err) = std::fs::remove_dir_all(dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %err, "legacy lock cleanup failed");
            }
        } else {
            info!(path = %dir.display(), "removed legacy heartbeat lock directory");
        }
    }
}
