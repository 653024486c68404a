//! The ordered, short-circuiting admission chain run per inbound
//! request.
//!
//! Stage order follows the hardened original: whitelist bypass →
//! blacklist deny → user-agent heuristics → header heuristics →
//! honeypot → temporary block → rate limit → behaviour counter →
//! bad-IP classification. The first disallowing stage wins and its
//! reason selects the block action; the core only *selects* the
//! action, executing it is the serving layer's business.

use crate::heuristics;
use dashmap::DashMap;
use jiff::Timestamp;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use turnstile_core::{BlockEvent, RequestContext};
use turnstile_limiter::RateLimiter;
use turnstile_matcher::{parse_cidr, parse_ipv4, IntervalMatcher, RangeKind};
use turnstile_queue::{
    topics, BlacklistAdd, RangeHit, WriteBehindQueue,
};
use typed_builder::TypedBuilder;

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blacklisted,
    EmptyUserAgent,
    ShortUserAgent,
    InvalidUserAgent,
    KnownBotAgent,
    MissingHeaders,
    Honeypot,
    TempBlocked,
    RateLimited,
    SuspiciousBehavior,
    MaliciousIp,
    DatacenterIp,
    ProxyIp,
    BotIp,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blacklisted => "blacklisted",
            Self::EmptyUserAgent => "empty_user_agent",
            Self::ShortUserAgent => "short_user_agent",
            Self::InvalidUserAgent => "invalid_user_agent",
            Self::KnownBotAgent => "known_bot_agent",
            Self::MissingHeaders => "missing_headers",
            Self::Honeypot => "honeypot",
            Self::TempBlocked => "temp_blocked",
            Self::RateLimited => "rate_limited",
            Self::SuspiciousBehavior => "suspicious_behavior",
            Self::MaliciousIp => "malicious_ip",
            Self::DatacenterIp => "datacenter_ip",
            Self::ProxyIp => "proxy_ip",
            Self::BotIp => "bot_ip",
        }
    }
}

/// How the serving layer should answer a denied request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BlockAction {
    /// Plain error page with the given status.
    ErrorPage { status: u16 },
    /// Send the visitor somewhere harmless.
    Redirect { url: String },
    /// Serve innocuous fake content with a 200.
    FakeContent,
    /// Answer with an error after a deliberate delay.
    DelayedError,
    /// Drip-feed bytes to waste the scraper's time.
    Tarpit,
    /// Challenge the visitor.
    Captcha,
    /// Log the denial but serve normally.
    SilentLog,
}

/// Outcome of the admission chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub detail: String,
    /// Present on rate-limit and temp-block denials.
    pub retry_after: Option<Duration>,
    /// Present on denials; chosen from policy.
    pub action: Option<BlockAction>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            detail: String::new(),
            retry_after: None,
            action: None,
        }
    }

    fn deny(reason: DenyReason, detail: impl Into<String>, action: BlockAction) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            detail: detail.into(),
            retry_after: None,
            action: Some(action),
        }
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct AdmissionConfig {
    /// CIDR ranges that bypass every check.
    #[builder(default)]
    pub whitelist: Vec<String>,

    /// User-agent substrings exempt from the bot-keyword check.
    #[builder(default)]
    pub ua_whitelist: Vec<String>,

    #[builder(default = heuristics::DEFAULT_BOT_KEYWORDS.iter().map(|s| s.to_string()).collect())]
    pub bot_keywords: Vec<String>,

    #[builder(default = heuristics::DEFAULT_HONEYPOT_PATHS.iter().map(|s| s.to_string()).collect())]
    pub honeypot_paths: Vec<String>,

    #[builder(default = heuristics::DEFAULT_REQUIRED_HEADERS.iter().map(|s| s.to_string()).collect())]
    pub required_headers: Vec<String>,

    #[builder(default = 30)]
    pub min_ua_length: usize,

    #[builder(default = true)]
    pub block_empty_ua: bool,

    #[builder(default = true)]
    pub require_mozilla: bool,

    /// Deny traffic from datacenter ranges. Off by default: plenty of
    /// legitimate traffic originates from VPNs on cloud providers.
    #[builder(default = false)]
    pub block_datacenter: bool,

    #[builder(default = false)]
    pub block_proxy: bool,

    /// Deny traffic from known-bot IP ranges even when the user agent
    /// looks clean.
    #[builder(default = false)]
    pub block_bot_ips: bool,

    /// How long a tripped IP stays blocked.
    #[builder(default = Duration::from_secs(3_600))]
    pub temp_block: Duration,

    /// Window for the suspicious-path behaviour counter.
    #[builder(default = Duration::from_secs(300))]
    pub suspicious_window: Duration,

    /// Suspicious requests within the window before an IP is denied.
    #[builder(default = 5)]
    pub suspicious_max: u32,

    /// Window for counting denials toward auto-blacklisting.
    #[builder(default = Duration::from_secs(300))]
    pub auto_blacklist_window: Duration,

    /// Denials within the window before the IP is blacklisted.
    #[builder(default = 5)]
    pub auto_blacklist_max: u32,

    /// Action selected for denials without a more specific one.
    #[builder(default = BlockAction::ErrorPage { status: 403 })]
    pub block_action: BlockAction,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Per-reason denial counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub denied_by_reason: HashMap<&'static str, u64>,
    pub temp_blocked: usize,
}

struct WindowCounter {
    started: Instant,
    count: u32,
}

impl WindowCounter {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    fn bump(&mut self, window: Duration) -> u32 {
        if self.started.elapsed() > window {
            self.started = Instant::now();
            self.count = 0;
        }
        self.count += 1;
        self.count
    }

    fn current(&self, window: Duration) -> u32 {
        if self.started.elapsed() > window {
            0
        } else {
            self.count
        }
    }
}

const COUNTER_WATERMARK: usize = 10_000;

/// The ordered decision chain. Performs no store I/O: the matcher
/// snapshot is refreshed out-of-band, counters live in-process, and
/// every write (block log, hit count, auto-blacklist) is an enqueue.
pub struct AdmissionPipeline {
    config: AdmissionConfig,
    whitelist: Vec<(u32, u32)>,
    matcher: Arc<IntervalMatcher>,
    limiter: Arc<RateLimiter>,
    queue: Arc<WriteBehindQueue>,
    temp_blocks: DashMap<String, Instant>,
    suspicious: Mutex<HashMap<String, WindowCounter>>,
    denials: Mutex<HashMap<String, WindowCounter>>,
    reason_counts: DashMap<&'static str, u64>,
}

impl AdmissionPipeline {
    pub fn new(
        config: AdmissionConfig,
        matcher: Arc<IntervalMatcher>,
        limiter: Arc<RateLimiter>,
        queue: Arc<WriteBehindQueue>,
    ) -> Self {
        let whitelist = config
            .whitelist
            .iter()
            .filter_map(|cidr| match parse_cidr(cidr) {
                Ok(range) => Some(range),
                Err(e) => {
                    warn!(cidr, error = %e, "skipping unparsable whitelist entry");
                    None
                }
            })
            .collect();

        Self {
            config,
            whitelist,
            matcher,
            limiter,
            queue,
            temp_blocks: DashMap::new(),
            suspicious: Mutex::new(HashMap::new()),
            denials: Mutex::new(HashMap::new()),
            reason_counts: DashMap::new(),
        }
    }

    /// Runs the full chain and records the outcome.
    pub fn admit(&self, ctx: &RequestContext) -> Decision {
        if self.is_whitelisted(&ctx.visitor_ip) {
            debug!(ip = %ctx.visitor_ip, "whitelisted, bypassing admission checks");
            return Decision::allow();
        }

        let decision = self.run_stages(ctx);
        if decision.allowed {
            self.record_allowed(ctx);
        } else {
            self.record_denial(ctx, &decision);
        }
        decision
    }

    fn run_stages(&self, ctx: &RequestContext) -> Decision {
        let matched = self.matcher.lookup(&ctx.visitor_ip);

        // Manual blacklist entries deny before anything else.
        if let Some(rule) = &matched {
            if rule.kind == RangeKind::Custom {
                self.note_range_hit(rule.rule_id);
                return self.deny(
                    DenyReason::Blacklisted,
                    format!("blacklisted by {} ({})", rule.name, rule.cidr),
                );
            }
        }

        if let Some((reason, detail)) = heuristics::check_user_agent(&ctx.user_agent, &self.config)
        {
            return self.deny(reason, detail);
        }

        if let Some((reason, detail)) = heuristics::check_headers(ctx, &self.config) {
            return self.deny(reason, detail);
        }

        if heuristics::is_honeypot_path(&ctx.path, &self.config) {
            self.auto_blacklist(
                &ctx.visitor_ip,
                &format!("honeypot tripped: {}", ctx.path),
            );
            // Probers get a 404, not a confession.
            return Decision::deny(
                DenyReason::Honeypot,
                format!("honeypot path: {}", ctx.path),
                BlockAction::ErrorPage { status: 404 },
            );
        }

        if let Some(until) = self.temp_block_remaining(&ctx.visitor_ip) {
            let mut decision = self.deny(
                DenyReason::TempBlocked,
                "temporarily blocked for earlier abuse",
            );
            decision.retry_after = Some(until);
            return decision;
        }

        let rate = self.limiter.check(ctx.rate_key());
        if !rate.allowed {
            // Tripping the limiter earns a real block, so repeat
            // offenders stop consuming limiter budget at all.
            self.temp_block(&ctx.visitor_ip);
            let mut decision = self.deny(DenyReason::RateLimited, "request rate exceeded");
            decision.retry_after = Some(rate.retry_after);
            return decision;
        }

        if self.suspicious_count(&ctx.visitor_ip) >= self.config.suspicious_max {
            self.temp_block(&ctx.visitor_ip);
            return self.deny(
                DenyReason::SuspiciousBehavior,
                "too many suspicious paths in window",
            );
        }

        if let Some(rule) = &matched {
            let classified = match rule.kind {
                RangeKind::Malicious => Some(DenyReason::MaliciousIp),
                RangeKind::Datacenter if self.config.block_datacenter => {
                    Some(DenyReason::DatacenterIp)
                }
                RangeKind::Proxy if self.config.block_proxy => Some(DenyReason::ProxyIp),
                RangeKind::Bot if self.config.block_bot_ips => Some(DenyReason::BotIp),
                _ => None,
            };
            if let Some(reason) = classified {
                self.note_range_hit(rule.rule_id);
                return self.deny(
                    reason,
                    format!("{} range {} ({})", rule.kind.as_str(), rule.cidr, rule.name),
                );
            }
        }

        Decision::allow()
    }

    fn deny(&self, reason: DenyReason, detail: impl Into<String>) -> Decision {
        Decision::deny(reason, detail, self.config.block_action.clone())
    }

    fn is_whitelisted(&self, ip: &str) -> bool {
        let Some(ip) = parse_ipv4(ip) else {
            return false;
        };
        self.whitelist
            .iter()
            .any(|(start, end)| *start <= ip && ip <= *end)
    }

    fn temp_block(&self, ip: &str) {
        info!(ip, duration = ?self.config.temp_block, "temporarily blocking ip");
        self.temp_blocks
            .insert(ip.to_owned(), Instant::now() + self.config.temp_block);
    }

    /// Time left on an active block; expired entries are dropped.
    fn temp_block_remaining(&self, ip: &str) -> Option<Duration> {
        let now = Instant::now();
        if let Some(entry) = self.temp_blocks.get(ip) {
            let until = *entry;
            drop(entry);
            if until > now {
                return Some(until - now);
            }
            self.temp_blocks.remove(ip);
        }
        None
    }

    fn suspicious_count(&self, ip: &str) -> u32 {
        let counters = self.suspicious.lock();
        counters
            .get(ip)
            .map_or(0, |c| c.current(self.config.suspicious_window))
    }

    /// Allowed requests still feed the behaviour counter when their
    /// path looks like probing.
    fn record_allowed(&self, ctx: &RequestContext) {
        if heuristics::is_suspicious_path(&ctx.path) {
            let mut counters = self.suspicious.lock();
            Self::prune_counters(&mut counters, self.config.suspicious_window);
            counters
                .entry(ctx.visitor_ip.clone())
                .or_insert_with(WindowCounter::new)
                .bump(self.config.suspicious_window);
        }
    }

    fn record_denial(&self, ctx: &RequestContext, decision: &Decision) {
        let Some(reason) = decision.reason else {
            return;
        };
        *self.reason_counts.entry(reason.as_str()).or_insert(0) += 1;

        self.queue.push_event(
            topics::BLOCK_LOG,
            &BlockEvent {
                visitor_ip: ctx.visitor_ip.clone(),
                reason: reason.as_str().to_string(),
                detail: decision.detail.clone(),
                user_agent: ctx.user_agent.chars().take(200).collect(),
                path: ctx.path.chars().take(200).collect(),
                at: Timestamp::now(),
            },
        );

        // Already-blacklisted IPs would re-add themselves forever,
        // and a temp-blocked request is the same offence counted
        // twice.
        if matches!(reason, DenyReason::Blacklisted | DenyReason::TempBlocked) {
            return;
        }

        let denials = {
            let mut counters = self.denials.lock();
            Self::prune_counters(&mut counters, self.config.auto_blacklist_window);
            counters
                .entry(ctx.visitor_ip.clone())
                .or_insert_with(WindowCounter::new)
                .bump(self.config.auto_blacklist_window)
        };

        if denials >= self.config.auto_blacklist_max {
            self.auto_blacklist(
                &ctx.visitor_ip,
                &format!(
                    "{} denials within {:?}",
                    denials, self.config.auto_blacklist_window
                ),
            );
        }
    }

    /// Queues a permanent blacklist entry for the store and blocks
    /// the IP immediately; the matcher picks the rule up on its next
    /// refresh.
    fn auto_blacklist(&self, ip: &str, reason: &str) {
        info!(ip, reason, "auto-blacklisting");
        self.queue.push_event(
            topics::BLACKLIST_ADD,
            &BlacklistAdd {
                cidr: format!("{}/32", ip),
                reason: reason.to_string(),
            },
        );
        self.temp_block(ip);
    }

    fn note_range_hit(&self, rule_id: i64) {
        self.queue
            .push_event(topics::RANGE_HIT, &RangeHit { rule_id, hits: 1 });
    }

    fn prune_counters(counters: &mut HashMap<String, WindowCounter>, window: Duration) {
        if counters.len() > COUNTER_WATERMARK {
            counters.retain(|_, c| c.started.elapsed() <= window);
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            denied_by_reason: self
                .reason_counts
                .iter()
                .map(|entry| (*entry.key(), *entry.value()))
                .collect(),
            temp_blocked: self.temp_blocks.len(),
        }
    }
}
