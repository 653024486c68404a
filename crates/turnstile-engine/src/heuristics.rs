//! Request heuristics for the admission pipeline: user-agent
//! screening, required-header checks, honeypot paths, and the
//! suspicious-path classifier feeding the behaviour counter.

use crate::pipeline::{AdmissionConfig, DenyReason};
use turnstile_core::RequestContext;

/// User-agent fragments belonging to known crawlers, HTTP libraries,
/// and scanners. Matched case-insensitively as substrings.
pub const DEFAULT_BOT_KEYWORDS: &[&str] = &[
    "googlebot",
    "bingbot",
    "slurp",
    "duckduckbot",
    "baiduspider",
    "yandexbot",
    "sogou",
    "360spider",
    "bytespider",
    "petalbot",
    "semrushbot",
    "ahrefsbot",
    "bot",
    "spider",
    "crawler",
    "scraper",
    "curl",
    "wget",
    "python",
    "java",
    "php",
    "perl",
    "ruby",
    "go-http",
    "node-fetch",
    "axios",
    "httpclient",
    "okhttp",
    "requests",
    "scrapy",
    "puppeteer",
    "playwright",
    "selenium",
    "headless",
    "phantom",
    "nikto",
    "nmap",
    "sqlmap",
    "masscan",
    "nuclei",
    "gobuster",
    "wfuzz",
    "burp",
    "zaproxy",
    "libwww",
    "mechanize",
    "feedfetcher",
    "facebookexternalhit",
    "twitterbot",
];

/// Paths no legitimate visitor of a redirect service requests.
/// Hitting one is treated as active probing.
pub const DEFAULT_HONEYPOT_PATHS: &[&str] = &[
    "/wp-admin",
    "/wp-login.php",
    "/administrator",
    "/admin.php.bak",
    "/phpmyadmin",
    "/.env",
    "/.git",
    "/config.php.bak",
    "/backup",
    "/db.sql",
    "/dump.sql",
    "/.htaccess",
    "/web.config",
    "/xmlrpc.php",
    "/wp-content",
    "/wp-includes",
    "/.well-known/security.txt",
];

/// Headers every mainstream browser sends.
pub const DEFAULT_REQUIRED_HEADERS: &[&str] = &["accept", "accept-language", "accept-encoding"];

/// Screens the user-agent string. Returns the deny reason and detail
/// on rejection.
pub fn check_user_agent(ua: &str, config: &AdmissionConfig) -> Option<(DenyReason, String)> {
    let trimmed = ua.trim();
    if config.block_empty_ua && trimmed.is_empty() {
        return Some((DenyReason::EmptyUserAgent, "user agent is empty".to_string()));
    }

    if trimmed.len() < config.min_ua_length {
        return Some((
            DenyReason::ShortUserAgent,
            format!("user agent shorter than {} chars", config.min_ua_length),
        ));
    }

    let lower = trimmed.to_lowercase();
    if config.require_mozilla && !lower.contains("mozilla") {
        return Some((
            DenyReason::InvalidUserAgent,
            "user agent lacks Mozilla marker".to_string(),
        ));
    }

    if config
        .ua_whitelist
        .iter()
        .any(|allowed| lower.contains(&allowed.to_lowercase()))
    {
        return None;
    }

    for keyword in &config.bot_keywords {
        if lower.contains(keyword.as_str()) {
            return Some((
                DenyReason::KnownBotAgent,
                format!("bot keyword detected: {}", keyword),
            ));
        }
    }

    None
}

/// Rejects requests missing two or more of the required headers; a
/// single absent header is tolerated for unusual but real clients.
pub fn check_headers(ctx: &RequestContext, config: &AdmissionConfig) -> Option<(DenyReason, String)> {
    let missing: Vec<&str> = config
        .required_headers
        .iter()
        .map(String::as_str)
        .filter(|h| !ctx.has_header(h))
        .collect();

    if missing.len() >= 2 {
        return Some((
            DenyReason::MissingHeaders,
            format!("missing headers: {}", missing.join(", ")),
        ));
    }
    None
}

/// Returns `true` if the path touches a honeypot location.
pub fn is_honeypot_path(path: &str, config: &AdmissionConfig) -> bool {
    let lower = path.to_lowercase();
    config
        .honeypot_paths
        .iter()
        .any(|trap| lower.contains(&trap.to_lowercase()))
}

/// Classifies a path as probing-shaped: script extensions, leaked
/// file suffixes, admin surfaces, or traversal attempts.
pub fn is_suspicious_path(path: &str) -> bool {
    let lower = path.to_lowercase();

    if let Some(idx) = lower.rfind(".php") {
        if lower[idx + 4..].chars().all(|c| c.is_ascii_digit()) {
            return true;
        }
    }

    const LEAK_SUFFIXES: &[&str] = &[".bak", ".old", ".backup", ".sql", ".env", ".git", ".svn"];
    if LEAK_SUFFIXES.iter().any(|s| lower.contains(s)) {
        return true;
    }

    const ADMIN_FRAGMENTS: &[&str] = &["admin", "login", "wp-", "phpmyadmin", "config"];
    if ADMIN_FRAGMENTS.iter().any(|s| lower.contains(s)) {
        return true;
    }

    lower.contains("../")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AdmissionConfig;

    const BROWSER_UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

    fn config() -> AdmissionConfig {
        AdmissionConfig::default()
    }

    #[test]
    fn browser_agent_passes() {
        assert!(check_user_agent(BROWSER_UA, &config()).is_none());
    }

    #[test]
    fn empty_agent_rejected() {
        let (reason, _) = check_user_agent("  ", &config()).unwrap();
        assert_eq!(reason, DenyReason::EmptyUserAgent);
    }

    #[test]
    fn short_agent_rejected() {
        let (reason, _) = check_user_agent("Mozilla/5.0", &config()).unwrap();
        assert_eq!(reason, DenyReason::ShortUserAgent);
    }

    #[test]
    fn missing_mozilla_marker_rejected() {
        let (reason, _) =
            check_user_agent("curl/8.4.0 (x86_64-pc-linux-gnu) libcurl/8.4.0", &config()).unwrap();
        assert_eq!(reason, DenyReason::InvalidUserAgent);
    }

    #[test]
    fn bot_keyword_rejected() {
        let ua = "Mozilla/5.0 (compatible; SemrushBot/7~bl; +http://www.semrush.com/bot.html)";
        let (reason, detail) = check_user_agent(ua, &config()).unwrap();
        assert_eq!(reason, DenyReason::KnownBotAgent);
        assert!(detail.contains("semrushbot"));
    }

    #[test]
    fn ua_whitelist_overrides_keywords() {
        let mut config = config();
        config.ua_whitelist = vec!["GoodMonitorBot".to_string()];

        let ua = "Mozilla/5.0 (compatible; GoodMonitorBot/1.0; uptime checks)";
        assert!(check_user_agent(ua, &config).is_none());
    }

    #[test]
    fn one_missing_header_tolerated() {
        let ctx = turnstile_core::RequestContext::builder()
            .visitor_ip("203.0.113.9")
            .headers_present(vec!["accept".into(), "accept-encoding".into()])
            .build();
        assert!(check_headers(&ctx, &config()).is_none());
    }

    #[test]
    fn two_missing_headers_rejected() {
        let ctx = turnstile_core::RequestContext::builder()
            .visitor_ip("203.0.113.9")
            .headers_present(vec!["accept".into()])
            .build();
        let (reason, detail) = check_headers(&ctx, &config()).unwrap();
        assert_eq!(reason, DenyReason::MissingHeaders);
        assert!(detail.contains("accept-language"));
    }

    #[test]
    fn honeypot_paths_match_substrings() {
        let config = config();
        assert!(is_honeypot_path("/wp-admin/setup.php", &config));
        assert!(is_honeypot_path("/site/.env", &config));
        assert!(!is_honeypot_path("/r/abc123", &config));
    }

    #[test]
    fn suspicious_path_classifier() {
        assert!(is_suspicious_path("/index.php"));
        assert!(is_suspicious_path("/shell.php3"));
        assert!(is_suspicious_path("/backup.sql"));
        assert!(is_suspicious_path("/old-login"));
        assert!(is_suspicious_path("/a/../../etc/passwd"));
        assert!(!is_suspicious_path("/r/abc123"));
        assert!(!is_suspicious_path("/"));
    }
}
