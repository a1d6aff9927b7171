use std::path::PathBuf;

/// On-disk layout under the install root (`~/.webpilot` by default).
///
/// Everything the CLI persists between invocations lives here: the CDP port
/// file, the PID record for browsers we spawned, the long-lived browser
/// profile, and downloaded/captured artifacts.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".webpilot"))
            .unwrap_or_else(|| PathBuf::from(".webpilot"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Persisted CDP port (a bare integer). Removed by `close`.
    pub fn port_file(&self) -> PathBuf {
        self.base.join("cdp-port")
    }

    /// PID record for a browser process this tool launched.
    pub fn pid_file(&self) -> PathBuf {
        self.base.join("browser.pid.json")
    }

    /// Long-lived browser profile. Survives `close`.
    pub fn profile_dir(&self) -> PathBuf {
        self.base.join("profile")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.base.join("downloads")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.base.join("media")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.downloads_dir())?;
        std::fs::create_dir_all(self.media_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_layout() {
        let p = Paths::with_base(PathBuf::from("/tmp/wp"));
        assert_eq!(p.port_file(), PathBuf::from("/tmp/wp/cdp-port"));
        assert_eq!(p.pid_file(), PathBuf::from("/tmp/wp/browser.pid.json"));
        assert_eq!(p.profile_dir(), PathBuf::from("/tmp/wp/profile"));
        assert_eq!(p.downloads_dir(), PathBuf::from("/tmp/wp/downloads"));
    }

    #[test]
    fn test_ensure_dirs_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let p = Paths::with_base(tmp.path().join("root"));
        p.ensure_dirs().unwrap();
        p.ensure_dirs().unwrap();
        assert!(p.downloads_dir().is_dir());
        assert!(p.media_dir().is_dir());
        // The profile dir is created lazily by profile preparation, not here.
        assert!(!p.profile_dir().exists());
    }
}
