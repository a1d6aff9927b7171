//! Sensitive-domain blocklist.
//!
//! Navigation and free-form actions are checked against this list before
//! anything reaches the browser. Entries are either bare domains (matching the
//! exact host or any subdomain) or domain+path prefixes (matching by substring
//! on host+path). Runtime mutations apply to the current process only.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// Domains whose credentials or sessions we never want an automated browser
/// anywhere near: banking, brokerage, payments, email, healthcare, government.
const DEFAULT_BLOCKED: &[&str] = &[
    // Banking and brokerage
    "chase.com",
    "bankofamerica.com",
    "wellsfargo.com",
    "citibank.com",
    "citi.com",
    "capitalone.com",
    "usbank.com",
    "schwab.com",
    "fidelity.com",
    "vanguard.com",
    "etrade.com",
    "robinhood.com",
    // Payments
    "paypal.com",
    "venmo.com",
    "cash.app",
    "wise.com",
    // Email
    "mail.google.com",
    "outlook.live.com",
    "outlook.office.com",
    "mail.yahoo.com",
    "mail.proton.me",
    "mail.aol.com",
    "icloud.com/mail",
    // Healthcare
    "mychart.com",
    "healthcare.gov",
    "kaiserpermanente.org",
    "anthem.com",
    "cigna.com",
    "uhc.com",
    // Government
    "irs.gov",
    "ssa.gov",
    "uscis.gov",
    "studentaid.gov",
    "login.gov",
    "id.me",
];

/// Matches URLs embedded in free text: scheme-prefixed or `www.`-prefixed.
static URL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s"'<>()\[\]]+"#).unwrap());

pub struct Blocklist {
    entries: Vec<String>,
}

impl Default for Blocklist {
    fn default() -> Self {
        Self {
            entries: DEFAULT_BLOCKED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Blocklist {
    pub fn new(entries: Vec<String>) -> Self {
        let mut list = Self { entries: Vec::new() };
        for entry in entries {
            list.add(&entry);
        }
        list
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Check a URL against the blocklist. Returns the matching entry.
    ///
    /// Unparseable input returns `None` (fail-open), so relative or internal
    /// navigations are never spuriously blocked.
    pub fn is_blocked(&self, raw_url: &str) -> Option<&str> {
        let url = Url::parse(raw_url).ok()?;
        let host = url.host_str()?.to_lowercase();
        let host_and_path = format!("{}{}", host, url.path());

        for entry in &self.entries {
            if entry.contains('/') {
                // Path-scoped entry: substring match on host+path.
                if host_and_path.contains(entry.as_str()) {
                    return Some(entry.as_str());
                }
            } else if host == *entry || host.ends_with(&format!(".{}", entry)) {
                return Some(entry.as_str());
            }
        }
        None
    }

    /// Scan free-form instruction text for embedded URLs and check each one.
    ///
    /// Heuristic defense against instructions that smuggle a blocked URL as an
    /// argument ("go to https://chase.com and log in").
    pub fn is_action_blocked(&self, action: &str) -> Option<&str> {
        for m in URL_IN_TEXT.find_iter(action) {
            let found = m.as_str();
            let candidate = if found.to_lowercase().starts_with("www.") {
                format!("https://{}", found)
            } else {
                found.to_string()
            };
            if let Some(domain) = self.is_blocked(&candidate) {
                return Some(domain);
            }
        }
        None
    }

    /// Add an entry. Input is normalized (scheme stripped, trailing slash
    /// stripped, lowercased); duplicates are ignored.
    pub fn add(&mut self, entry: &str) -> bool {
        let normalized = normalize(entry);
        if normalized.is_empty() || self.entries.contains(&normalized) {
            return false;
        }
        self.entries.push(normalized);
        true
    }

    /// Remove an entry. Returns whether it was present.
    pub fn remove(&mut self, entry: &str) -> bool {
        let normalized = normalize(entry);
        let before = self.entries.len();
        self.entries.retain(|e| *e != normalized);
        self.entries.len() != before
    }
}

fn normalize(entry: &str) -> String {
    let mut e = entry.trim().to_lowercase();
    for scheme in ["https://", "http://"] {
        if let Some(rest) = e.strip_prefix(scheme) {
            e = rest.to_string();
            break;
        }
    }
    e.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_exact_host_and_subdomains() {
        let list = Blocklist::default();
        assert_eq!(list.is_blocked("https://chase.com/login"), Some("chase.com"));
        assert_eq!(list.is_blocked("https://secure.chase.com/"), Some("chase.com"));
        assert_eq!(list.is_blocked("HTTPS://CHASE.COM"), Some("chase.com"));
        assert_eq!(list.is_blocked("https://example.com"), None);
    }

    #[test]
    fn test_suffix_match_requires_dot_boundary() {
        let list = Blocklist::new(vec!["chase.com".to_string()]);
        // notchase.com must not match by suffix.
        assert_eq!(list.is_blocked("https://notchase.com"), None);
    }

    #[test]
    fn test_bare_domain_does_not_cover_unlisted_siblings() {
        // mail.google.com is listed; google.com itself is not.
        let list = Blocklist::default();
        assert_eq!(list.is_blocked("https://mail.google.com/inbox"), Some("mail.google.com"));
        assert_eq!(list.is_blocked("https://www.google.com/search"), None);
        assert_eq!(list.is_blocked("https://accounts.google.com"), None);
    }

    #[test]
    fn test_path_scoped_entry() {
        let list = Blocklist::new(vec!["icloud.com/mail".to_string()]);
        assert_eq!(list.is_blocked("https://www.icloud.com/mail/inbox"), Some("icloud.com/mail"));
        // Sibling paths on the same host are fine.
        assert_eq!(list.is_blocked("https://www.icloud.com/photos"), None);
    }

    #[test]
    fn test_fail_open_on_unparseable() {
        let list = Blocklist::default();
        assert_eq!(list.is_blocked("/relative/path"), None);
        assert_eq!(list.is_blocked("not a url at all"), None);
        assert_eq!(list.is_blocked(""), None);
    }

    #[test]
    fn test_action_text_scanning() {
        let list = Blocklist::default();
        assert_eq!(
            list.is_action_blocked("go to https://chase.com and log in"),
            Some("chase.com")
        );
        assert_eq!(
            list.is_action_blocked("open www.paypal.com/signin please"),
            Some("paypal.com")
        );
        assert_eq!(list.is_action_blocked("click the login button"), None);
        assert_eq!(
            list.is_action_blocked("compare https://example.com and https://irs.gov/payments"),
            Some("irs.gov")
        );
    }

    #[test]
    fn test_add_normalizes_and_deduplicates() {
        let mut list = Blocklist::new(vec![]);
        assert!(list.add("https://Example.com/"));
        assert!(!list.add("example.com"));
        assert_eq!(list.entries(), &["example.com".to_string()]);
        assert_eq!(list.is_blocked("https://sub.example.com"), Some("example.com"));
    }

    #[test]
    fn test_remove_reports_presence() {
        let mut list = Blocklist::new(vec!["example.com".to_string()]);
        assert!(list.remove("http://example.com/"));
        assert!(!list.remove("example.com"));
        assert_eq!(list.is_blocked("https://example.com"), None);
    }
}
