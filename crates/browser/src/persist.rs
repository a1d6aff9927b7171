//! Port, PID, and profile persistence shared between CLI invocations.
//!
//! Each invocation is a separate process; the filesystem is the only
//! synchronization point. All writers are idempotent check-then-write with
//! last-writer-wins semantics, since the caller issues commands sequentially.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use webpilot_core::{Paths, Result};

/// CDP ports are drawn from a high range well clear of the conventional 9222,
/// to avoid colliding with other debugging tooling.
const PORT_RANGE: std::ops::RangeInclusive<u16> = 49152..=59151;

/// Files never copied out of the user's real profile: Chrome's saved-password
/// and autofill/payment stores and their SQLite journals.
const EXCLUDED_PROFILE_FILES: &[&str] = &[
    "Login Data",
    "Login Data-journal",
    "Web Data",
    "Web Data-journal",
];

/// Resolve the CDP port for this working installation.
///
/// Reuses the persisted port if one exists and parses; otherwise picks a
/// random port in the high range and persists it immediately, so every
/// subsequent invocation reconnects to the same browser.
pub fn resolve_port(paths: &Paths) -> Result<u16> {
    let port_file = paths.port_file();
    if let Ok(content) = std::fs::read_to_string(&port_file) {
        if let Ok(port) = content.trim().parse::<u16>() {
            if port > 0 {
                debug!(port, "Reusing persisted CDP port");
                return Ok(port);
            }
        }
        warn!(path = %port_file.display(), "Ignoring unparseable port file");
    }

    let port = rand::thread_rng().gen_range(PORT_RANGE);
    paths.ensure_dirs()?;
    std::fs::write(&port_file, port.to_string())?;
    info!(port, "Selected new CDP port");
    Ok(port)
}

/// Delete the persisted port so the next invocation picks a fresh one.
pub fn clear_port(paths: &Paths) {
    let _ = std::fs::remove_file(paths.port_file());
}

/// `{pid, startTime}` for a browser process this tool launched. Consumed
/// during shutdown to force-kill if the graceful paths fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidRecord {
    pub pid: u32,
    /// Unix millis at spawn time.
    pub start_time: i64,
}

impl PidRecord {
    pub fn now(pid: u32) -> Self {
        Self {
            pid,
            start_time: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub fn write_pid_record(paths: &Paths, record: &PidRecord) -> Result<()> {
    paths.ensure_dirs()?;
    let content = serde_json::to_string_pretty(record)?;
    std::fs::write(paths.pid_file(), content)?;
    Ok(())
}

pub fn read_pid_record(paths: &Paths) -> Option<PidRecord> {
    let content = std::fs::read_to_string(paths.pid_file()).ok()?;
    serde_json::from_str(&content).ok()
}

pub fn clear_pid_record(paths: &Paths) {
    let _ = std::fs::remove_file(paths.pid_file());
}

/// Prepare the persistent browser profile.
///
/// First run: copy the user's real Chrome profile, minus credential stores,
/// so logged-in sessions carry over without ever holding saved passwords or
/// payment data. Every run after that is a no-op — the diverged profile is
/// never refreshed from the source again, since a re-copy would invalidate
/// the session cookies that have moved on in the copy.
pub fn prepare_profile(paths: &Paths) -> Result<PathBuf> {
    prepare_profile_from(paths, source_profile_dir().as_deref())
}

/// The copy goes into a staging directory and is renamed into place only once
/// it completes, so a failed copy never leaves a half-populated `profile/`
/// that the exists-check above would then freeze forever.
fn prepare_profile_from(paths: &Paths, source: Option<&Path>) -> Result<PathBuf> {
    let profile = paths.profile_dir();
    if profile.exists() {
        debug!(path = %profile.display(), "Profile already prepared");
        return Ok(profile);
    }

    paths.ensure_dirs()?;
    match source {
        Some(source) if source.is_dir() => {
            let staging = profile.with_extension("partial");
            if staging.exists() {
                std::fs::remove_dir_all(&staging)?;
            }
            info!(source = %source.display(), dest = %profile.display(), "Copying browser profile (excluding credential stores)");
            if let Err(e) = copy_dir_filtered(source, &staging) {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(e);
            }
            std::fs::rename(&staging, &profile)?;
        }
        _ => {
            info!(dest = %profile.display(), "No existing browser profile found; starting fresh");
            std::fs::create_dir_all(&profile)?;
        }
    }
    Ok(profile)
}

/// Delete the persistent profile. Only reachable via the explicit
/// `clean-profile` command, never from `close`.
pub fn remove_profile(paths: &Paths) -> Result<bool> {
    let profile = paths.profile_dir();
    if !profile.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(&profile)?;
    Ok(true)
}

/// Locate the user's real Chrome user-data directory for this platform.
fn source_profile_dir() -> Option<PathBuf> {
    if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library/Application Support/Google/Chrome"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir().map(|d| d.join("Google").join("Chrome").join("User Data"))
    } else {
        dirs::config_dir().map(|c| c.join("google-chrome"))
    }
}

/// Recursive copy skipping credential-bearing file names at any depth.
/// Individual file failures (locked SQLite databases while Chrome runs) are
/// logged and skipped rather than aborting the whole copy.
fn copy_dir_filtered(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        let file_name = name.to_string_lossy();
        if EXCLUDED_PROFILE_FILES.contains(&file_name.as_ref()) {
            debug!(file = %file_name, "Skipping credential store");
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_filtered(&from, &to)?;
        } else if file_type.is_file() {
            if let Err(e) = std::fs::copy(&from, &to) {
                warn!(file = %from.display(), "Skipping unreadable profile file: {}", e);
            }
        }
        // Symlinks are skipped; Chrome profiles don't rely on them.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> (tempfile::TempDir, Paths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("webpilot"));
        (tmp, paths)
    }

    #[test]
    fn test_port_resolution_is_idempotent() {
        let (_tmp, paths) = temp_paths();
        let first = resolve_port(&paths).unwrap();
        let second = resolve_port(&paths).unwrap();
        assert_eq!(first, second);
        assert!(PORT_RANGE.contains(&first));
    }

    #[test]
    fn test_port_cleared_then_reselected() {
        let (_tmp, paths) = temp_paths();
        let first = resolve_port(&paths).unwrap();
        clear_port(&paths);
        assert!(!paths.port_file().exists());
        // A fresh resolution must succeed; it may or may not collide with the
        // old value, so only the invariant range is asserted.
        let second = resolve_port(&paths).unwrap();
        assert!(PORT_RANGE.contains(&second));
        let _ = first;
    }

    #[test]
    fn test_garbage_port_file_is_replaced() {
        let (_tmp, paths) = temp_paths();
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.port_file(), "not-a-port").unwrap();
        let port = resolve_port(&paths).unwrap();
        assert!(PORT_RANGE.contains(&port));
        // The replacement was persisted.
        assert_eq!(
            std::fs::read_to_string(paths.port_file()).unwrap().trim(),
            port.to_string()
        );
    }

    #[test]
    fn test_pid_record_roundtrip_and_clear() {
        let (_tmp, paths) = temp_paths();
        let record = PidRecord::now(4242);
        write_pid_record(&paths, &record).unwrap();
        let read = read_pid_record(&paths).unwrap();
        assert_eq!(read.pid, 4242);
        assert_eq!(read.start_time, record.start_time);
        clear_pid_record(&paths);
        assert!(read_pid_record(&paths).is_none());
        // Clearing twice is harmless.
        clear_pid_record(&paths);
    }

    #[test]
    fn test_copy_excludes_credential_files() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        std::fs::create_dir_all(source.join("Default")).unwrap();
        std::fs::write(source.join("Local State"), "{}").unwrap();
        std::fs::write(source.join("Default/Cookies"), "cookies").unwrap();
        std::fs::write(source.join("Default/Login Data"), "secrets").unwrap();
        std::fs::write(source.join("Default/Login Data-journal"), "secrets").unwrap();
        std::fs::write(source.join("Default/Web Data"), "autofill").unwrap();
        std::fs::write(source.join("Default/Web Data-journal"), "autofill").unwrap();

        let dest = tmp.path().join("dest");
        copy_dir_filtered(&source, &dest).unwrap();

        assert!(dest.join("Local State").exists());
        assert!(dest.join("Default/Cookies").exists());
        assert!(!dest.join("Default/Login Data").exists());
        assert!(!dest.join("Default/Login Data-journal").exists());
        assert!(!dest.join("Default/Web Data").exists());
        assert!(!dest.join("Default/Web Data-journal").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_failed_copy_leaves_no_profile_behind() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("webpilot"));
        let source = tmp.path().join("source");
        std::fs::create_dir_all(source.join("locked")).unwrap();
        std::fs::write(source.join("Local State"), "{}").unwrap();
        std::fs::set_permissions(
            source.join("locked"),
            std::fs::Permissions::from_mode(0o000),
        )
        .unwrap();
        if std::fs::read_dir(source.join("locked")).is_ok() {
            // Running with DAC override (root); the fault cannot be injected.
            return;
        }

        let err = prepare_profile_from(&paths, Some(&source));
        assert!(err.is_err());
        // Neither a half-copied profile nor staging debris remains, so the
        // next invocation retries the copy instead of freezing a partial one.
        assert!(!paths.profile_dir().exists());
        assert!(!paths.profile_dir().with_extension("partial").exists());

        std::fs::set_permissions(
            source.join("locked"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        let dir = prepare_profile_from(&paths, Some(&source)).unwrap();
        assert!(dir.join("Local State").exists());
    }

    #[test]
    fn test_prepare_profile_discards_stale_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("webpilot"));
        let source = tmp.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("Local State"), "{}").unwrap();

        let staging = paths.profile_dir().with_extension("partial");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("debris"), "interrupted copy").unwrap();

        let dir = prepare_profile_from(&paths, Some(&source)).unwrap();
        assert!(dir.join("Local State").exists());
        assert!(!dir.join("debris").exists());
        assert!(!staging.exists());
    }

    #[test]
    fn test_prepare_profile_noop_when_present() {
        let (_tmp, paths) = temp_paths();
        std::fs::create_dir_all(paths.profile_dir()).unwrap();
        let marker = paths.profile_dir().join("diverged.txt");
        std::fs::write(&marker, "local state").unwrap();

        let dir = prepare_profile(&paths).unwrap();
        assert_eq!(dir, paths.profile_dir());
        // The diverged profile was not overwritten.
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "local state");
    }

    #[test]
    fn test_remove_profile_reports_presence() {
        let (_tmp, paths) = temp_paths();
        assert!(!remove_profile(&paths).unwrap());
        std::fs::create_dir_all(paths.profile_dir()).unwrap();
        assert!(remove_profile(&paths).unwrap());
        assert!(!paths.profile_dir().exists());
    }
}
