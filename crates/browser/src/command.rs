//! Command dispatcher: maps CLI verbs to blocklist-gated lifecycle and engine
//! operations, producing the uniform result shape printed by the binary.
//!
//! Nothing here lets an error escape: every failure becomes a structured
//! `CommandResult` so the process can exit cleanly and print JSON.

use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use webpilot_core::{Config, Error, Paths, Result};

use crate::blocklist::Blocklist;
use crate::engine::Engine;
use crate::persist;
use crate::session::SessionManager;

/// Uniform result of every command: `{success, message?, error?, screenshot?}`.
#[derive(Debug, Serialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            screenshot: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            screenshot: None,
        }
    }

    pub fn with_screenshot(mut self, path: Option<String>) -> Self {
        self.screenshot = path;
        self
    }

    fn blocked(domain: &str) -> Self {
        Self::fail(format!(
            "BLOCKED: Navigation to \"{}\" is restricted by security policy.",
            domain
        ))
    }
}

pub struct Dispatcher {
    manager: SessionManager,
    blocklist: Blocklist,
    engine: Engine,
}

impl Dispatcher {
    pub fn new(paths: Paths, config: &Config) -> Self {
        Self {
            manager: SessionManager::new(paths),
            blocklist: Blocklist::default(),
            engine: Engine::new(&config.engine),
        }
    }

    pub async fn navigate(&mut self, url: &str) -> CommandResult {
        if let Some(domain) = self.blocklist.is_blocked(url) {
            let domain = domain.to_string();
            info!(url, domain = %domain, "Navigation blocked");
            return CommandResult::blocked(&domain);
        }
        match self.manager.navigate(url).await {
            Ok(()) => {
                let shot = self.capture_screenshot().await;
                CommandResult::ok(format!("Navigated to {}", url)).with_screenshot(shot)
            }
            Err(e) => CommandResult::fail(e.to_string()),
        }
    }

    pub async fn act(&mut self, instruction: &str) -> CommandResult {
        if let Some(domain) = self.blocklist.is_action_blocked(instruction) {
            let domain = domain.to_string();
            info!(instruction, domain = %domain, "Action blocked");
            return CommandResult::blocked(&domain);
        }
        match self.run_act(instruction).await {
            Ok(message) => {
                let shot = self.capture_screenshot().await;
                CommandResult::ok(message).with_screenshot(shot)
            }
            Err(e) => CommandResult::fail(e.to_string()),
        }
    }

    async fn run_act(&mut self, instruction: &str) -> Result<String> {
        let session = self.manager.ensure_ready().await?;
        self.engine.act(&session.cdp, instruction).await
    }

    pub async fn extract(&mut self, instruction: &str, schema_json: Option<&str>) -> CommandResult {
        let schema = match schema_json.map(parse_extract_schema).transpose() {
            Ok(s) => s.flatten(),
            Err(e) => return CommandResult::fail(e.to_string()),
        };
        match self.run_extract(instruction, schema.as_ref()).await {
            Ok(extracted) => {
                let shot = self.capture_screenshot().await;
                CommandResult::ok(format!("Extracted: {}", extracted)).with_screenshot(shot)
            }
            Err(e) => CommandResult::fail(e.to_string()),
        }
    }

    async fn run_extract(
        &mut self,
        instruction: &str,
        schema: Option<&serde_json::Map<String, Value>>,
    ) -> Result<Value> {
        let session = self.manager.ensure_ready().await?;
        self.engine.extract(&session.cdp, instruction, schema).await
    }

    pub async fn observe(&mut self, query: &str) -> CommandResult {
        match self.run_observe(query).await {
            Ok(observed) => {
                let shot = self.capture_screenshot().await;
                CommandResult::ok(format!("Observed: {}", observed)).with_screenshot(shot)
            }
            Err(e) => CommandResult::fail(e.to_string()),
        }
    }

    async fn run_observe(&mut self, query: &str) -> Result<Value> {
        let session = self.manager.ensure_ready().await?;
        self.engine.observe(&session.cdp, query).await
    }

    pub async fn screenshot(&mut self) -> CommandResult {
        match self.run_screenshot().await {
            Ok(path) => CommandResult {
                success: true,
                message: None,
                error: None,
                screenshot: Some(path),
            },
            Err(e) => CommandResult::fail(e.to_string()),
        }
    }

    async fn run_screenshot(&mut self) -> Result<String> {
        let session = self.manager.ensure_ready().await?;
        let data = session.cdp.screenshot().await?;
        write_screenshot(self.manager.paths(), &data)
    }

    /// Shut the browser down and clear ephemeral state. The profile directory
    /// is preserved so logins survive.
    pub async fn close(&mut self) -> CommandResult {
        let report = self.manager.shutdown().await;
        persist::clear_port(self.manager.paths());
        let mut message = "Browser closed (profile preserved)".to_string();
        if !report.is_clean() {
            message.push_str(&format!("; warnings: {}", report.warnings.join("; ")));
        }
        CommandResult::ok(message)
    }

    /// Explicit profile cleanup. This is the only path that deletes the
    /// persistent profile.
    pub async fn clean_profile(&mut self) -> CommandResult {
        let report = self.manager.shutdown().await;
        persist::clear_port(self.manager.paths());
        if !report.is_clean() {
            warn!("Shutdown before profile cleanup had warnings: {:?}", report.warnings);
        }
        match persist::remove_profile(self.manager.paths()) {
            Ok(true) => CommandResult::ok("Browser profile removed"),
            Ok(false) => CommandResult::ok("No browser profile to remove"),
            Err(e) => CommandResult::fail(e.to_string()),
        }
    }

    /// Shutdown path shared with signal handling; mirrors `close` without
    /// producing a result.
    pub async fn shutdown_on_interrupt(&mut self) {
        let _ = self.manager.shutdown().await;
        persist::clear_port(self.manager.paths());
    }

    /// Capture a screenshot artifact after a successful command. Best-effort:
    /// a failed capture downgrades to a missing artifact, not a failed command.
    async fn capture_screenshot(&mut self) -> Option<String> {
        let session = self.manager.ensure_ready().await.ok()?;
        match session.cdp.screenshot().await {
            Ok(data) => match write_screenshot(self.manager.paths(), &data) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Failed to write screenshot: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Screenshot capture failed: {}", e);
                None
            }
        }
    }
}

fn write_screenshot(paths: &Paths, base64_data: &str) -> Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(base64_data)
        .map_err(|e| Error::Browser(format!("Bad screenshot payload: {}", e)))?;
    paths.ensure_dirs()?;
    let path = paths
        .media_dir()
        .join(format!("web_{}.png", chrono::Utc::now().format("%Y%m%d_%H%M%S%3f")));
    std::fs::write(&path, bytes)?;
    Ok(path.display().to_string())
}

/// Parse the optional `extract` schema: a flat JSON object mapping field names
/// to `string` / `number` / `boolean`. Fields with unrecognized types are
/// silently dropped; if nothing recognizable remains, there is no schema.
pub fn parse_extract_schema(raw: &str) -> Result<Option<serde_json::Map<String, Value>>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::Validation(format!("Schema is not valid JSON: {}", e)))?;
    let Value::Object(fields) = value else {
        return Err(Error::Validation("Schema must be a JSON object".to_string()));
    };

    let mut schema = serde_json::Map::new();
    for (name, ty) in fields {
        match ty.as_str() {
            Some("string") | Some("number") | Some("boolean") => {
                schema.insert(name, ty);
            }
            _ => {}
        }
    }
    Ok(if schema.is_empty() { None } else { Some(schema) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_dispatcher() -> (tempfile::TempDir, Dispatcher) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(tmp.path().join("webpilot"));
        let dispatcher = Dispatcher::new(paths, &Config::default());
        (tmp, dispatcher)
    }

    #[tokio::test]
    async fn test_navigate_blocked_short_circuits() {
        let (tmp, mut dispatcher) = test_dispatcher();
        let result = dispatcher.navigate("https://chase.com/login").await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("BLOCKED: Navigation to \"chase.com\" is restricted by security policy.")
        );
        // Blocked before the session: no port file, no pid file, no browser.
        let base = tmp.path().join("webpilot");
        assert!(!base.join("cdp-port").exists());
        assert!(!base.join("browser.pid.json").exists());
    }

    #[tokio::test]
    async fn test_act_blocked_by_embedded_url() {
        let (_tmp, mut dispatcher) = test_dispatcher();
        let result = dispatcher.act("go to https://chase.com and log in").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("chase.com"));
    }

    #[tokio::test]
    async fn test_close_removes_port_file_keeps_profile() {
        let (tmp, mut dispatcher) = test_dispatcher();
        let base = tmp.path().join("webpilot");
        std::fs::create_dir_all(base.join("profile")).unwrap();
        std::fs::write(base.join("cdp-port"), "55555").unwrap();
        std::fs::write(base.join("browser.pid.json"), r#"{"pid":1,"startTime":0}"#).unwrap();

        let result = dispatcher.close().await;
        assert!(result.success);
        assert!(result.message.unwrap().starts_with("Browser closed (profile preserved)"));
        assert!(!base.join("cdp-port").exists());
        assert!(!base.join("browser.pid.json").exists());
        assert!(base.join("profile").exists());
    }

    #[tokio::test]
    async fn test_clean_profile_removes_profile() {
        let (tmp, mut dispatcher) = test_dispatcher();
        let base = tmp.path().join("webpilot");
        std::fs::create_dir_all(base.join("profile")).unwrap();

        let result = dispatcher.clean_profile().await;
        assert!(result.success);
        assert!(!base.join("profile").exists());

        let again = dispatcher.clean_profile().await;
        assert_eq!(again.message.as_deref(), Some("No browser profile to remove"));
    }

    #[test]
    fn test_schema_drops_unknown_types() {
        let schema = parse_extract_schema(r#"{"price":"number","color":"purple"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema.get("price"), Some(&json!("number")));
    }

    #[test]
    fn test_schema_all_invalid_becomes_none() {
        assert!(parse_extract_schema(r#"{"a":"purple","b":"object"}"#).unwrap().is_none());
        assert!(parse_extract_schema("{}").unwrap().is_none());
    }

    #[test]
    fn test_schema_malformed_is_error() {
        assert!(parse_extract_schema("not json").is_err());
        assert!(parse_extract_schema(r#"["array"]"#).is_err());
    }

    #[test]
    fn test_result_serialization_omits_absent_fields() {
        let ok = serde_json::to_value(CommandResult::ok("done")).unwrap();
        assert_eq!(ok, json!({"success": true, "message": "done"}));
        let fail = serde_json::to_value(CommandResult::fail("boom")).unwrap();
        assert_eq!(fail, json!({"success": false, "error": "boom"}));
    }
}
