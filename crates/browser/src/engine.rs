//! Automation engine: translates natural-language instructions into concrete
//! page actions via an OpenAI-compatible chat endpoint.
//!
//! The engine is a collaborator, not core logic. It is handed an already
//! gated, already ready page; everything security-relevant happened before a
//! request is built here.

use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use webpilot_core::config::EngineConfig;
use webpilot_core::{Error, Result};

use crate::cdp::CdpClient;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Compact page state shipped with every engine request.
#[derive(Debug)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    /// Interactive elements as one line each: index, tag, text, selector.
    pub elements: String,
}

pub struct Engine {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        let api_base = config
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: config.api_key.clone(),
            api_base,
            model: config.model.clone(),
        }
    }

    /// Perform a natural-language action on the current page. Returns a short
    /// description of what was done.
    pub async fn act(&self, cdp: &CdpClient, instruction: &str) -> Result<String> {
        let ctx = page_context(cdp).await?;
        let system = "You control a web page. Given the page state and an instruction, \
            respond with ONLY a JSON object: {\"action\": \"click\"|\"fill\"|\"press\", \
            \"selector\": \"<css selector>\", \"text\": \"<text for fill, key for press>\"}.";
        let user = format!(
            "Page: {} ({})\nInteractive elements:\n{}\nInstruction: {}",
            ctx.title, ctx.url, ctx.elements, instruction
        );
        let raw = self.complete(system, &user).await?;
        let action: Value = parse_json_reply(&raw)?;

        let kind = action.get("action").and_then(|v| v.as_str()).unwrap_or("");
        let selector = action.get("selector").and_then(|v| v.as_str()).unwrap_or("");
        let text = action.get("text").and_then(|v| v.as_str()).unwrap_or("");
        apply_action(cdp, kind, selector, text).await?;
        Ok(format!("Performed {} on \"{}\"", kind, selector))
    }

    /// Extract structured data. `schema` is a flat field→type map; when
    /// absent, the engine returns whatever shape fits the instruction.
    pub async fn extract(
        &self,
        cdp: &CdpClient,
        instruction: &str,
        schema: Option<&serde_json::Map<String, Value>>,
    ) -> Result<Value> {
        let ctx = page_context(cdp).await?;
        let text = page_text(cdp).await?;
        let mut system = String::from(
            "Extract the requested data from the page. Respond with ONLY a JSON object.",
        );
        if let Some(schema) = schema {
            system.push_str(&format!(
                " The object must have exactly these fields and types: {}",
                Value::Object(schema.clone())
            ));
        }
        let user = format!(
            "Page: {} ({})\nContent:\n{}\nExtract: {}",
            ctx.title, ctx.url, text, instruction
        );
        let raw = self.complete(&system, &user).await?;
        parse_json_reply(&raw)
    }

    /// Describe the actions available on the current page for a query.
    pub async fn observe(&self, cdp: &CdpClient, query: &str) -> Result<Value> {
        let ctx = page_context(cdp).await?;
        let system = "List the page elements relevant to the query. Respond with ONLY a JSON \
            array of objects: [{\"description\": \"...\", \"selector\": \"...\"}].";
        let user = format!(
            "Page: {} ({})\nInteractive elements:\n{}\nQuery: {}",
            ctx.title, ctx.url, ctx.elements, query
        );
        let raw = self.complete(system, &user).await?;
        parse_json_reply(&raw)
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0,
        });

        debug!(model = %self.model, "Engine request");
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Engine(format!("Request failed: {}", e)))?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| Error::Engine(format!("Invalid response: {}", e)))?;
        if !status.is_success() {
            let msg = payload
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(Error::Engine(format!("API error ({}): {}", status, msg)));
        }
        payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Engine("Empty completion".to_string()))
    }
}

/// Parse a model reply that should be JSON, tolerating code fences.
fn parse_json_reply(raw: &str) -> Result<Value> {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed)
        .map_err(|e| Error::Engine(format!("Engine returned non-JSON reply: {}", e)))
}

/// Collect URL, title, and a numbered list of interactive elements.
async fn page_context(cdp: &CdpClient) -> Result<PageContext> {
    let js = r#"(() => {
    const els = document.querySelectorAll('a, button, input, select, textarea, [role=button], [onclick]');
    const lines = [];
    for (let i = 0; i < Math.min(els.length, 80); i++) {
        const el = els[i];
        const rect = el.getBoundingClientRect();
        if (rect.width === 0 || rect.height === 0) continue;
        const text = (el.innerText || el.value || el.placeholder || el.getAttribute('aria-label') || '').trim().slice(0, 80);
        let selector = el.tagName.toLowerCase();
        if (el.id) selector += '#' + el.id;
        else if (el.name) selector += `[name="${el.name}"]`;
        lines.push(`${i}. <${el.tagName.toLowerCase()}> "${text}" selector=${selector}`);
    }
    return JSON.stringify({ url: location.href, title: document.title, elements: lines.join('\n') });
})()"#;
    let raw = cdp.evaluate_js(js).await?;
    let parsed: Value = match raw {
        Value::String(s) => serde_json::from_str(&s)
            .map_err(|e| Error::Browser(format!("Bad page context: {}", e)))?,
        other => other,
    };
    Ok(PageContext {
        url: parsed.get("url").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        title: parsed.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        elements: parsed.get("elements").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
    })
}

async fn page_text(cdp: &CdpClient) -> Result<String> {
    let raw = cdp
        .evaluate_js("document.body ? document.body.innerText.slice(0, 20000) : ''")
        .await?;
    Ok(raw.as_str().unwrap_or_default().to_string())
}

/// Apply an engine-chosen action to the page via CDP-evaluated JS.
async fn apply_action(cdp: &CdpClient, kind: &str, selector: &str, text: &str) -> Result<()> {
    let escaped_sel = selector.replace('\\', "\\\\").replace('\'', "\\'");
    let escaped_text = text.replace('\\', "\\\\").replace('\'', "\\'");
    let js = match kind {
        "click" => format!(
            "(() => {{ const el = document.querySelector('{}'); if (!el) return 'not_found'; \
             el.scrollIntoView({{block:'center'}}); el.click(); return 'ok'; }})()",
            escaped_sel
        ),
        "fill" => format!(
            "(() => {{ const el = document.querySelector('{}'); if (!el) return 'not_found'; \
             el.focus(); el.value = '{}'; \
             el.dispatchEvent(new Event('input', {{bubbles:true}})); \
             el.dispatchEvent(new Event('change', {{bubbles:true}})); return 'ok'; }})()",
            escaped_sel, escaped_text
        ),
        "press" => format!(
            "(() => {{ const el = document.querySelector('{}') || document.activeElement; \
             if (!el) return 'not_found'; \
             el.dispatchEvent(new KeyboardEvent('keydown', {{key:'{}', bubbles:true}})); \
             el.dispatchEvent(new KeyboardEvent('keyup', {{key:'{}', bubbles:true}})); return 'ok'; }})()",
            escaped_sel, escaped_text, escaped_text
        ),
        other => return Err(Error::Engine(format!("Unknown engine action: {}", other))),
    };
    let result = cdp.evaluate_js(&js).await?;
    if result.as_str() == Some("not_found") {
        return Err(Error::Engine(format!("Element not found: {}", selector)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_reply_plain_and_fenced() {
        assert_eq!(
            parse_json_reply(r#"{"a": 1}"#).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            parse_json_reply("```json\n{\"a\": 1}\n```").unwrap(),
            json!({"a": 1})
        );
        assert!(parse_json_reply("sorry, I cannot").is_err());
    }

    #[test]
    fn test_engine_base_url_trimmed() {
        let cfg = EngineConfig {
            api_key: "k".to_string(),
            api_base: Some("http://localhost:8000/v1/".to_string()),
            model: "m".to_string(),
        };
        let engine = Engine::new(&cfg);
        assert_eq!(engine.api_base, "http://localhost:8000/v1");
    }
}
