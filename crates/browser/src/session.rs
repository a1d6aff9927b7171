//! Browser session lifecycle: discover or launch Chrome, attach over CDP,
//! and tear it all down again.
//!
//! A session is per CLI process, but the browser it fronts usually is not:
//! after the first invocation the common case is reconnecting to a browser an
//! earlier invocation started. `ensure_ready` therefore always probes the
//! persisted port before spawning, and `owns_process` records which case we
//! are in so shutdown can tell a child apart from an adopted browser.

use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webpilot_core::{Error, Paths, Result};

use crate::cdp::CdpClient;
use crate::persist::{self, PidRecord};

/// Fixed viewport forced on the page for deterministic screenshots.
pub const VIEWPORT_WIDTH: u32 = 1280;
pub const VIEWPORT_HEIGHT: u32 = 900;

const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LAUNCH_POLL_ATTEMPTS: u32 = 150; // 30s total
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const GRACEFUL_EXIT_WAIT: Duration = Duration::from_secs(2);

/// An attached, ready browser. One active page target.
pub struct Session {
    pub port: u16,
    pub ws_url: String,
    /// True only when this invocation spawned the browser process.
    pub owns_process: bool,
    process: Option<Child>,
    pub cdp: CdpClient,
}

/// Outcome of a best-effort shutdown. Shutdown never fails outright; every
/// internal problem is recorded here so callers (and tests) can see partial
/// failures instead of silence.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub warnings: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!("Shutdown: {}", msg);
        self.warnings.push(msg);
    }
}

/// Owns the optional in-process session and the lifecycle transitions around
/// it. Held by the dispatcher for the duration of one CLI invocation.
pub struct SessionManager {
    paths: Paths,
    session: Option<Session>,
}

impl SessionManager {
    pub fn new(paths: Paths) -> Self {
        Self { paths, session: None }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Get a ready session, reusing the in-process handle when present.
    ///
    /// Otherwise: resolve the persisted port, prepare the profile, probe for
    /// an already-running debuggable browser, attach or spawn accordingly,
    /// then configure the page (fixed viewport, download directory) and wait
    /// for it to become interactive.
    pub async fn ensure_ready(&mut self) -> Result<&mut Session> {
        if self.session.is_none() {
            let port = persist::resolve_port(&self.paths)?;
            let profile = persist::prepare_profile(&self.paths)?;
            let session = self.attach_or_launch(port, &profile).await?;
            self.session = Some(session);
        }
        Ok(self.session.as_mut().expect("session just ensured"))
    }

    async fn attach_or_launch(&self, port: u16, profile: &Path) -> Result<Session> {
        let (mut process, owns_process) = if probe_cdp(port).await.is_some() {
            info!(port, "Reusing running browser");
            (None, false)
        } else {
            let browser_path = find_browser_binary().ok_or_else(|| {
                Error::Browser("No Chrome or Chromium installation found. Please install one.".to_string())
            })?;
            let child = spawn_browser(&browser_path, port, profile).await?;
            if let Some(pid) = child.id() {
                persist::write_pid_record(&self.paths, &PidRecord::now(pid))?;
            }
            (Some(child), true)
        };

        match self.configure_page(port).await {
            Ok((ws_url, cdp)) => {
                info!(port, owns_process, "Browser session ready");
                Ok(Session {
                    port,
                    ws_url,
                    owns_process,
                    process,
                    cdp,
                })
            }
            Err(e) => {
                // Launch failure: don't leave a half-started browser behind.
                if let Some(mut child) = process.take() {
                    let mut report = ShutdownReport::default();
                    terminate_child(&mut child, &mut report).await;
                    persist::clear_pid_record(&self.paths);
                }
                Err(e)
            }
        }
    }

    /// Shared attach path: wait for the CDP endpoint, connect to the first
    /// page target, and put the page into its deterministic baseline state.
    async fn configure_page(&self, port: u16) -> Result<(String, CdpClient)> {
        wait_for_cdp(port).await?;
        let ws_url = page_ws_url(port).await?;
        let cdp = CdpClient::connect(&ws_url).await?;
        cdp.enable_domain("Page").await?;
        cdp.enable_domain("Runtime").await?;
        cdp.enable_domain("DOM").await?;
        cdp.set_device_metrics(VIEWPORT_WIDTH, VIEWPORT_HEIGHT).await?;
        if let Err(e) = cdp
            .set_download_dir(&self.paths.downloads_dir().display().to_string())
            .await
        {
            // Older Chromes reject Browser.* on page sessions; not fatal.
            debug!("Download redirection unavailable: {}", e);
        }
        wait_for_document_ready(&cdp, "complete", 20).await;
        Ok((ws_url, cdp))
    }

    /// Navigate the active page and wait for it to settle.
    ///
    /// Primary wait is full `complete`; if the page never gets there (heavy
    /// SPAs, long-polling trackers), fall back to a shorter wait for
    /// `interactive` before giving up.
    pub async fn navigate(&mut self, url: &str) -> Result<()> {
        let session = self.ensure_ready().await?;
        let result = session.cdp.navigate(url).await?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(Error::Browser(format!("Navigation failed: {}", err)));
        }
        if !wait_for_document_ready(&session.cdp, "complete", 30).await {
            if !wait_for_document_ready(&session.cdp, "interactive", 10).await {
                return Err(Error::Timeout(format!("Page did not become ready: {}", url)));
            }
        }
        Ok(())
    }

    /// Best-effort teardown. Never returns an error; all failures become
    /// warnings in the report, since shutdown frequently runs inside another
    /// failure's cleanup path.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let port = self.session.as_ref().map(|s| s.port).or_else(|| {
            std::fs::read_to_string(self.paths.port_file())
                .ok()
                .and_then(|s| s.trim().parse().ok())
        });

        // 1. Drop the in-process CDP handle and, if we spawned the browser,
        //    terminate the child gracefully then forcefully.
        if let Some(mut session) = self.session.take() {
            drop(session.cdp);
            if session.owns_process {
                if let Some(mut child) = session.process.take() {
                    terminate_child(&mut child, &mut report).await;
                }
            }
        }

        // 2. Ownership-independent sweep: this invocation may be closing a
        //    browser an earlier invocation started.
        if let Some(port) = port {
            if probe_cdp(port).await.is_some() {
                match close_via_cdp(port).await {
                    Ok(()) => sleep(GRACEFUL_EXIT_WAIT).await,
                    Err(e) => report.warn(format!("CDP-level close failed: {}", e)),
                }
                if probe_cdp(port).await.is_some() {
                    self.force_kill_recorded_pid(&mut report);
                }
            }
        }

        // 3. The PID record is consumed regardless of outcome. The profile
        //    directory is never touched here.
        persist::clear_pid_record(&self.paths);
        report
    }

    /// Last resort: kill the process from the PID record, but only after
    /// verifying that PID still belongs to a browser. PIDs get recycled; an
    /// unrelated process must never be the casualty.
    fn force_kill_recorded_pid(&self, report: &mut ShutdownReport) {
        let Some(record) = persist::read_pid_record(&self.paths) else {
            report.warn("Browser still responding and no PID record to fall back on");
            return;
        };
        if !is_browser_process(record.pid) {
            report.warn(format!(
                "PID {} is no longer a browser process; refusing to kill it",
                record.pid
            ));
            return;
        }
        if let Err(e) = kill_pid(record.pid) {
            report.warn(format!("Force-kill of PID {} failed: {}", record.pid, e));
        } else {
            info!(pid = record.pid, "Force-killed browser");
        }
    }
}

/// SIGTERM, a short wait, then SIGKILL for a browser we spawned.
async fn terminate_child(child: &mut Child, report: &mut ShutdownReport) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            report.warn(format!("SIGTERM to browser failed: {}", e));
        }
        if tokio::time::timeout(GRACEFUL_EXIT_WAIT, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(e) = child.kill().await {
        report.warn(format!("Force-kill of spawned browser failed: {}", e));
    }
}

/// Startup environment check: a usable browser must exist before any command
/// runs. Satisfied by a local Chrome/Chromium binary, or by an
/// already-running debuggable browser on the persisted port (reuse needs no
/// binary).
pub async fn require_browser(paths: &Paths) -> Result<()> {
    if find_browser_binary().is_some() {
        return Ok(());
    }
    if let Ok(content) = std::fs::read_to_string(paths.port_file()) {
        if let Ok(port) = content.trim().parse::<u16>() {
            if probe_cdp(port).await.is_some() {
                debug!(port, "No browser binary, but a running browser answers");
                return Ok(());
            }
        }
    }
    Err(Error::Browser(
        "No Chrome or Chromium installation found. Please install one.".to_string(),
    ))
}

/// Probe the CDP version endpoint. `Some(ws_url)` when a debuggable browser
/// answers on the port.
pub async fn probe_cdp(port: u16) -> Option<String> {
    let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build().ok()?;
    let url = format!("http://127.0.0.1:{}/json/version", port);
    let body: Value = client.get(&url).send().await.ok()?.json().await.ok()?;
    body.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Poll the CDP endpoint until the freshly-spawned browser answers.
async fn wait_for_cdp(port: u16) -> Result<()> {
    for _ in 0..LAUNCH_POLL_ATTEMPTS {
        if probe_cdp(port).await.is_some() {
            return Ok(());
        }
        sleep(LAUNCH_POLL_INTERVAL).await;
    }
    Err(Error::Timeout(format!(
        "Browser did not become ready on port {} within {}s",
        port,
        (LAUNCH_POLL_INTERVAL * LAUNCH_POLL_ATTEMPTS).as_secs()
    )))
}

/// First `page` target's WebSocket URL from `/json/list`. Retries briefly:
/// the initial tab may not have registered yet right after launch.
async fn page_ws_url(port: u16) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| Error::Browser(e.to_string()))?;
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            sleep(Duration::from_millis(300)).await;
        }
        let Ok(resp) = client.get(&url).send().await else { continue };
        let Ok(targets) = resp.json::<Vec<Value>>().await else { continue };
        for target in &targets {
            if target.get("type").and_then(|v| v.as_str()) == Some("page") {
                if let Some(ws) = target.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws.to_string());
                }
            }
        }
    }
    Err(Error::Browser("No page target found after retries".to_string()))
}

/// Poll `document.readyState`, tolerating evaluate failures during early
/// navigation. Returns whether the desired state was reached.
async fn wait_for_document_ready(cdp: &CdpClient, min_state: &str, attempts: u32) -> bool {
    for _ in 0..attempts {
        match cdp.evaluate_js("document.readyState").await {
            Ok(Value::String(state)) => {
                if state == "complete" || state == min_state {
                    return true;
                }
            }
            Ok(_) => {}
            Err(e) => debug!("readyState probe failed (page may be navigating): {}", e),
        }
        sleep(Duration::from_millis(500)).await;
    }
    false
}

/// Open a throwaway connection and trigger the browser's own graceful exit.
async fn close_via_cdp(port: u16) -> Result<()> {
    let ws_url = probe_cdp(port)
        .await
        .ok_or_else(|| Error::Browser("Browser stopped responding".to_string()))?;
    let cdp = CdpClient::connect(&ws_url).await?;
    cdp.browser_close().await?;
    drop(cdp);
    Ok(())
}

async fn spawn_browser(browser_path: &str, port: u16, profile: &Path) -> Result<Child> {
    let args = vec![
        format!("--remote-debugging-port={}", port),
        format!("--user-data-dir={}", profile.display()),
        format!("--window-size={},{}", VIEWPORT_WIDTH, VIEWPORT_HEIGHT),
        "--window-position=0,0".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
        "about:blank".to_string(),
    ];

    info!(port, path = %browser_path, "Spawning browser");
    // The browser must outlive this CLI process, so no kill_on_drop.
    Command::new(browser_path)
        .args(&args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| Error::Browser(format!("Failed to launch browser: {}", e)))
}

/// Find a local Chrome/Chromium binary.
pub fn find_browser_binary() -> Option<String> {
    let candidates: Vec<&str> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Check whether a PID currently belongs to a Chrome/Chromium process.
#[cfg(unix)]
fn is_browser_process(pid: u32) -> bool {
    let output = std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            let comm = String::from_utf8_lossy(&out.stdout).to_lowercase();
            comm.contains("chrome") || comm.contains("chromium")
        }
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_browser_process(_pid: u32) -> bool {
    // No portable comm lookup here; refuse rather than risk killing a
    // recycled PID.
    false
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| Error::Browser(format!("kill failed: {}", e)))
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) -> Result<()> {
    Err(Error::Browser("Force-kill unsupported on this platform".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_unused_port_is_none() {
        // Nothing should be listening on a random high port in tests.
        assert!(probe_cdp(59999).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_without_session_is_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("webpilot"));
        let mut manager = SessionManager::new(paths.clone());
        let report = manager.shutdown().await;
        assert!(report.is_clean(), "warnings: {:?}", report.warnings);
        assert!(!paths.pid_file().exists());
    }

    #[tokio::test]
    async fn test_shutdown_consumes_pid_record_and_keeps_profile() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("webpilot"));
        std::fs::create_dir_all(paths.profile_dir()).unwrap();
        std::fs::write(paths.profile_dir().join("state"), "x").unwrap();
        crate::persist::write_pid_record(&paths, &PidRecord::now(1)).unwrap();

        let mut manager = SessionManager::new(paths.clone());
        let _ = manager.shutdown().await;

        assert!(!paths.pid_file().exists());
        assert!(paths.profile_dir().join("state").exists());
    }

    #[tokio::test]
    async fn test_require_browser_ignores_dead_persisted_port() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("webpilot"));
        paths.ensure_dirs().unwrap();
        // Nothing listens on this port, so availability reduces to whether a
        // local browser binary exists.
        std::fs::write(paths.port_file(), "59998").unwrap();
        match require_browser(&paths).await {
            Ok(()) => assert!(find_browser_binary().is_some()),
            Err(e) => {
                assert!(find_browser_binary().is_none());
                assert!(e.to_string().contains("No Chrome or Chromium"));
            }
        }
    }

    #[test]
    fn test_pid_verification_rejects_non_browser() {
        // PID 1 is init/launchd, never a browser.
        assert!(!is_browser_process(1));
    }
}
