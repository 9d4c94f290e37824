use crate::config::SecurityConfig;
use crate::error::ChatError;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RAPID_WINDOW_SECS: u64 = 60;
const RAPID_REQUEST_LIMIT: usize = 10;
const SUSPICIOUS_THRESHOLD: u32 = 5;
const BLOCK_THRESHOLD: u32 = 20;

static TAG_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static INJECTION_FRAGMENTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"(?i)javascript:", r"(?i)\bon\w+\s*="]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});
static ATTACK_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<script[^>]*>.*?</script>",
        r"(?i)javascript:",
        r"(?i)\bon\w+\s*=",
        r"(?i)<iframe",
        r"(?i)<object",
        r"(?i)<embed",
        r"(?i)<form",
        r"(?i)<input",
        r"(?i)<textarea",
        r"(?i)<select",
        r"(?i)<button",
        r"(?i)<link",
        r"(?i)<meta",
        r"(?i)<style",
        r"(?i)<base",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Wall-clock capability, injected so tests can step time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SecurityStats {
    pub blocked_count: usize,
    pub suspicious_count: usize,
    pub active_window_count: usize,
    pub rate_limit_window_secs: u64,
    pub max_requests_per_window: usize,
}

#[derive(Default)]
struct GateState {
    request_log: HashMap<String, Vec<Instant>>,
    blocked_ips: HashSet<String>,
    suspicious_identities: HashMap<String, u32>,
}

/// Per-request admission: blocked-identity check, message validation, rate
/// limiting, abuse scoring, then sanitization. The counter state behind the
/// mutex is the gate's only mutable state.
pub struct SecurityGate {
    config: SecurityConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<GateState>,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SecurityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Runs the full admission pipeline and returns the sanitized message.
    pub fn admit(
        &self,
        user_id: &str,
        ip: Option<&str>,
        raw: &str,
    ) -> Result<String, ChatError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        if let Some(ip) = ip
            && state.blocked_ips.contains(ip)
        {
            warn!(%ip, "Rejected request from blocked address");
            return Err(ChatError::Blocked);
        }

        if raw.trim().is_empty() {
            return Err(ChatError::Validation("message is empty".to_string()));
        }
        if raw.chars().count() > self.config.max_message_length {
            return Err(ChatError::Validation(format!(
                "message exceeds maximum length of {} characters",
                self.config.max_message_length
            )));
        }

        self.check_rate_limit(&mut state, user_id, ip, now)?;

        if self.detect_suspicious(&mut state, user_id, ip, raw, now) {
            warn!(%user_id, "Blocked identity after suspicious activity");
            return Err(ChatError::Blocked);
        }

        self.record_request(&mut state, user_id, ip, now);
        drop(state);

        Ok(sanitize(raw))
    }

    fn check_rate_limit(
        &self,
        state: &mut GateState,
        user_id: &str,
        ip: Option<&str>,
        now: Instant,
    ) -> Result<(), ChatError> {
        let window = Duration::from_secs(self.config.rate_limit_window_secs);

        let user_count = prune_and_count(state, &user_key(user_id), now, window);
        if user_count >= self.config.max_requests_per_window {
            warn!(%user_id, "Rate limit exceeded");
            return Err(ChatError::RateLimited);
        }

        // IP ceiling sits at twice the per-user ceiling: one address may
        // legitimately carry several users.
        if let Some(ip) = ip {
            let ip_count = prune_and_count(state, &ip_key(ip), now, window);
            if ip_count >= self.config.max_requests_per_window * 2 {
                warn!(%ip, "Rate limit exceeded for address");
                return Err(ChatError::RateLimited);
            }
        }

        Ok(())
    }

    fn record_request(&self, state: &mut GateState, user_id: &str, ip: Option<&str>, now: Instant) {
        state
            .request_log
            .entry(user_key(user_id))
            .or_default()
            .push(now);
        if let Some(ip) = ip {
            state.request_log.entry(ip_key(ip)).or_default().push(now);
        }
    }

    /// Scores the message: attack signatures, word repetition, and request
    /// bursts. A low score only marks the identity; a high score blocks the
    /// address outright.
    fn detect_suspicious(
        &self,
        state: &mut GateState,
        user_id: &str,
        ip: Option<&str>,
        raw: &str,
        now: Instant,
    ) -> bool {
        let mut score: u32 = 0;

        for signature in ATTACK_SIGNATURES.iter() {
            if signature.is_match(raw) {
                score += 10;
            }
        }

        let words: Vec<&str> = raw.split_whitespace().collect();
        if words.len() > 10 {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for word in &words {
                *counts.entry(word.to_lowercase()).or_default() += 1;
            }
            let max_repetition = counts.values().copied().max().unwrap_or(0);
            if max_repetition * 10 > words.len() * 3 {
                score += 5;
            }
        }

        let rapid_cutoff = Duration::from_secs(RAPID_WINDOW_SECS);
        if let Some(log) = state.request_log.get(&user_key(user_id)) {
            let recent = log
                .iter()
                .filter(|at| now.duration_since(**at) < rapid_cutoff)
                .count();
            if recent > RAPID_REQUEST_LIMIT {
                score += 15;
            }
        }

        if score > SUSPICIOUS_THRESHOLD {
            let identity = ip.map(ip_key).unwrap_or_else(|| user_key(user_id));
            *state.suspicious_identities.entry(identity).or_default() += 1;
            debug!(%user_id, score, "Suspicious request counted");

            if score > BLOCK_THRESHOLD {
                if let Some(ip) = ip {
                    state.blocked_ips.insert(ip.to_string());
                }
                return true;
            }
        }

        false
    }

    /// Read-only aggregate counters for operational dashboards.
    pub fn stats(&self) -> SecurityStats {
        let state = self.state.lock().unwrap();
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.rate_limit_window_secs);

        let active_window_count = state
            .request_log
            .values()
            .map(|log| {
                log.iter()
                    .filter(|at| now.duration_since(**at) < window)
                    .count()
            })
            .sum();

        SecurityStats {
            blocked_count: state.blocked_ips.len(),
            suspicious_count: state.suspicious_identities.len(),
            active_window_count,
            rate_limit_window_secs: self.config.rate_limit_window_secs,
            max_requests_per_window: self.config.max_requests_per_window,
        }
    }

    /// Drops expired windows for identities that went quiet, so the counter
    /// map stays bounded. Runs off the request path.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let window = Duration::from_secs(self.config.rate_limit_window_secs);
        let mut state = self.state.lock().unwrap();

        state.request_log.retain(|_, log| {
            log.retain(|at| now.duration_since(*at) < window);
            !log.is_empty()
        });
    }
}

fn user_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

fn ip_key(ip: &str) -> String {
    format!("ip:{ip}")
}

fn prune_and_count(state: &mut GateState, key: &str, now: Instant, window: Duration) -> usize {
    match state.request_log.get_mut(key) {
        Some(log) => {
            log.retain(|at| now.duration_since(*at) < window);
            log.len()
        }
        None => 0,
    }
}

/// Neutralizes markup before storage or model submission. Idempotent: tag
/// runs and injection fragments are removed to a fixpoint, and the remaining
/// stray angle brackets are escaped without touching ampersands.
pub fn sanitize(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let mut next = TAG_RUN.replace_all(&current, "").into_owned();
        for fragment in INJECTION_FRAGMENTS.iter() {
            next = fragment.replace_all(&next, "").into_owned();
        }
        if next == current {
            break;
        }
        current = next;
    }

    let escaped = current.replace('<', "&lt;").replace('>', "&gt;");
    WHITESPACE_RUN
        .replace_all(&escaped, " ")
        .trim()
        .to_string()
}

/// Sanitizes every string value in a conversation-context blob, recursively.
pub fn sanitize_context(
    data: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    data.iter()
        .map(|(key, value)| (key.clone(), sanitize_value(value)))
        .collect()
}

fn sanitize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(text) => serde_json::Value::String(sanitize(text)),
        serde_json::Value::Object(map) => serde_json::Value::Object(sanitize_context(map)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_value).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn gate_with_clock(config: SecurityConfig) -> (SecurityGate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (SecurityGate::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn sanitize_strips_script_tags() {
        let out = sanitize("hello <script>alert('x')</script> world");
        assert!(!out.contains("<script"));
        assert_eq!(out, "hello alert('x') world");
    }

    #[test]
    fn sanitize_removes_event_handlers() {
        let out = sanitize("<img src=x onerror=alert(1)>click onload= here");
        assert!(!out.to_lowercase().contains("onerror="));
        assert!(!out.to_lowercase().contains("onload="));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "plain text",
            "<script>alert('x')</script>",
            "a < b > c",
            "javasjavascript:cript:alert(1)",
            "<<b>script>nested</script>",
            "  lots   of\t\twhitespace  ",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn sanitize_escapes_stray_brackets() {
        assert_eq!(sanitize("1 < 2"), "1 &lt; 2");
    }

    #[test]
    fn admit_rejects_overlong_message() {
        let gate = SecurityGate::new(SecurityConfig {
            max_message_length: 10,
            ..SecurityConfig::default()
        });
        let result = gate.admit("u1", None, "this message is far too long");
        assert!(matches!(result, Err(ChatError::Validation(_))));
    }

    #[test]
    fn admit_rejects_empty_message() {
        let gate = SecurityGate::new(SecurityConfig::default());
        assert!(matches!(
            gate.admit("u1", None, "   "),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn rate_limit_rejects_then_recovers_after_window() {
        let (gate, clock) = gate_with_clock(SecurityConfig {
            max_requests_per_window: 3,
            rate_limit_window_secs: 3600,
            ..SecurityConfig::default()
        });

        for _ in 0..3 {
            gate.admit("u1", None, "hello").unwrap();
            // Stay under the rapid-request heuristic.
            clock.advance(Duration::from_secs(120));
        }
        assert!(matches!(
            gate.admit("u1", None, "hello"),
            Err(ChatError::RateLimited)
        ));

        clock.advance(Duration::from_secs(3600));
        assert!(gate.admit("u1", None, "hello").is_ok());
    }

    #[test]
    fn ip_ceiling_is_twice_user_ceiling() {
        let (gate, clock) = gate_with_clock(SecurityConfig {
            max_requests_per_window: 2,
            rate_limit_window_secs: 3600,
            ..SecurityConfig::default()
        });

        // Four distinct users behind one address fill the 2x ceiling.
        for user in ["a", "b", "c", "d"] {
            gate.admit(user, Some("10.0.0.1"), "hi").unwrap();
            clock.advance(Duration::from_secs(120));
        }
        assert!(matches!(
            gate.admit("e", Some("10.0.0.1"), "hi"),
            Err(ChatError::RateLimited)
        ));
    }

    #[test]
    fn attack_heavy_message_blocks_address() {
        let gate = SecurityGate::new(SecurityConfig::default());
        let payload = "<script>x</script> javascript:alert(1) <iframe> onload=1";
        assert!(matches!(
            gate.admit("u1", Some("10.0.0.9"), payload),
            Err(ChatError::Blocked)
        ));
        // Subsequent requests from the same address are rejected outright.
        assert!(matches!(
            gate.admit("u2", Some("10.0.0.9"), "innocent"),
            Err(ChatError::Blocked)
        ));
        assert_eq!(gate.stats().blocked_count, 1);
    }

    #[test]
    fn single_signature_is_suspicious_but_not_blocking() {
        let gate = SecurityGate::new(SecurityConfig::default());
        let admitted = gate.admit("u1", Some("10.0.0.2"), "open javascript:void please");
        assert!(admitted.is_ok());
        assert!(!admitted.unwrap().contains("javascript:"));
        assert_eq!(gate.stats().suspicious_count, 1);
        assert_eq!(gate.stats().blocked_count, 0);
    }

    #[test]
    fn repetition_alone_stays_under_suspicion_threshold() {
        let gate = SecurityGate::new(SecurityConfig::default());
        let repeated = "spam ".repeat(20);
        assert!(gate.admit("u1", Some("10.0.0.2"), &repeated).is_ok());
        assert_eq!(gate.stats().suspicious_count, 0);
    }

    #[test]
    fn stats_counts_active_windows_and_sweep_prunes() {
        let (gate, clock) = gate_with_clock(SecurityConfig {
            rate_limit_window_secs: 60,
            ..SecurityConfig::default()
        });

        gate.admit("u1", Some("10.0.0.3"), "hello").unwrap();
        // One entry under the user key, one under the address key.
        assert_eq!(gate.stats().active_window_count, 2);

        clock.advance(Duration::from_secs(61));
        assert_eq!(gate.stats().active_window_count, 0);
        gate.sweep();
        assert_eq!(gate.stats().active_window_count, 0);
    }

    #[test]
    fn context_sanitization_reaches_nested_strings() {
        let data: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{"name": "<b>Ada</b>", "prefs": {"greeting": "<script>hi</script>"}, "tags": ["<i>x</i>", 3]}"#,
        )
        .unwrap();
        let clean = sanitize_context(&data);
        assert_eq!(clean["name"], "Ada");
        assert_eq!(clean["prefs"]["greeting"], "hi");
        assert_eq!(clean["tags"][0], "x");
        assert_eq!(clean["tags"][1], 3);
    }
}
