// Derives per-host last-request times from proxy logs, access-log files,
// and out-of-band timestamp files.
use crate::config::Config;
use crate::core::clock::Clock;
use crate::core::logger::Logger;
use crate::core::runner::Runner;
use crate::core::types::{is_self_host, sanitize_hostname};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bounded tail of the proxy log read per scan.
const PROXY_LOG_TAIL_LINES: usize = 1000;
/// Log entries older than this end a scan; the log is chronological.
const SCAN_HORIZON_SECS: i64 = 3600;
/// Minimum spacing between proxy-log reads; one read serves a whole tick's
/// worth of queries.
const SCAN_THROTTLE: Duration = Duration::from_secs(1);
/// Per-host timestamp files live in the OS temp dir under this prefix.
const TIMESTAMP_FILE_PREFIX: &str = "kamal_napper_last_request_";

const AUTOMATED_PATH_PATTERN: &str = r"^/(health|status|ping|ready|alive)/?$";
const AUTOMATED_AGENT_PATTERN: &str =
    r"(?i)(bot|crawler|spider|scraper|google|bing|yahoo|baidu|uptimerobot|pingdom|monitor|check|scan|probe)";
const COMBINED_LOG_PATTERN: &str = r#"^(\S+) \S+ \S+ \[([^\]]+)\] "(\S+) ([^" ]+)[^"]*" (\d{3}) \S+ "[^"]*" "([^"]*)"(?:\s+"?([^"\s]+)"?)?"#;

/// One parsed proxy request line.
struct ProxyRequest {
    host: String,
    time: DateTime<Utc>,
    automated: bool,
}

/// Watches traffic per hostname. All operations are infallible at the public
/// boundary: scan problems are logged and read as "no traffic observed".
pub struct RequestDetector {
    runner: Arc<Runner>,
    logger: Arc<Logger>,
    clock: Arc<dyn Clock>,
    own_hostname: Option<String>,
    access_log_dir: Option<PathBuf>,
    timestamp_dir: PathBuf,
    cache: std::sync::Mutex<HashMap<String, DateTime<Utc>>>,
    last_scan: std::sync::Mutex<Option<Instant>>,
}

impl RequestDetector {
    pub fn new(
        runner: Arc<Runner>,
        logger: Arc<Logger>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self::with_timestamp_dir(runner, logger, clock, config, std::env::temp_dir())
    }

    /// Create a detector with a custom timestamp-file directory (for testing).
    pub fn with_timestamp_dir(
        runner: Arc<Runner>,
        logger: Arc<Logger>,
        clock: Arc<dyn Clock>,
        config: &Config,
        timestamp_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            logger,
            clock,
            own_hostname: config.own_hostname.clone(),
            access_log_dir: config.access_log_dir.clone(),
            timestamp_dir,
            cache: std::sync::Mutex::new(HashMap::new()),
            last_scan: std::sync::Mutex::new(None),
        }
    }

    /// Most recent user request seen for `host`: maximum of the log-derived
    /// cache and the host's timestamp file.
    pub async fn last_request_time(&self, host: &str) -> Option<DateTime<Utc>> {
        self.refresh().await;

        let cached = self
            .cache
            .lock()
            .expect("request cache poisoned")
            .get(host)
            .copied();
        let from_file = self.read_timestamp_file(host).await;

        match (cached, from_file) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// True iff a user request for `host` landed within `within` of now.
    pub async fn recent_requests(&self, host: &str, within: Duration) -> bool {
        match self.last_request_time(host).await {
            Some(t) => {
                let age = self.clock.now() - t;
                age < chrono::Duration::from_std(within).unwrap_or(chrono::Duration::zero())
            }
            None => false,
        }
    }

    /// Every hostname seen in logs, timestamp files, or the cache, minus the
    /// daemon's own. Validity filtering beyond self is the caller's business.
    pub async fn detected_hostnames(&self) -> Vec<String> {
        self.refresh().await;

        let mut hosts: BTreeSet<String> = self
            .cache
            .lock()
            .expect("request cache poisoned")
            .keys()
            .cloned()
            .collect();
        hosts.extend(self.timestamp_file_hosts().await);

        hosts
            .into_iter()
            .filter(|h| !is_self_host(h, self.own_hostname.as_deref()))
            .collect()
    }

    /// Out-of-band observation: record a request for `host` at `t` in the
    /// cache and the host's timestamp file.
    pub async fn update_last_request_time(&self, host: &str, t: DateTime<Utc>) {
        self.merge_observation(host, t);

        let path = self.timestamp_path(host);
        if let Err(e) = tokio::fs::write(&path, t.to_rfc3339()).await {
            self.logger.warn(
                "detector",
                &format!("cannot write timestamp file {}: {e}", path.display()),
            );
        }
    }

    fn merge_observation(&self, host: &str, t: DateTime<Utc>) {
        let mut cache = self.cache.lock().expect("request cache poisoned");
        let entry = cache.entry(host.to_string()).or_insert(t);
        if t > *entry {
            *entry = t;
        }
    }

    /// Scan the proxy log tail (or the access-log fallback) and fold new
    /// observations into the cache. Throttled so a burst of queries inside
    /// one tick costs a single read.
    async fn refresh(&self) {
        {
            let mut last = self.last_scan.lock().expect("scan marker poisoned");
            if let Some(t) = *last {
                if t.elapsed() < SCAN_THROTTLE {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let now = self.clock.now();
        if let Some(tail) = self.runner.proxy_log_tail(PROXY_LOG_TAIL_LINES).await {
            self.scan_proxy_tail(&tail, now);
        } else if let Some(dir) = self.access_log_dir.clone() {
            self.scan_access_logs(&dir, now).await;
        }
    }

    /// Newest-first over the tail; stops at the first entry past the horizon.
    fn scan_proxy_tail(&self, tail: &str, now: DateTime<Utc>) {
        let (path_re, agent_re) = match automated_filters() {
            Ok(res) => res,
            Err(e) => {
                self.logger.error("detector", &format!("filter regex: {e}"));
                return;
            }
        };
        let horizon = now - chrono::Duration::seconds(SCAN_HORIZON_SECS);

        for line in tail.lines().rev() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(request) = parse_request_record(line, &path_re, &agent_re) else {
                continue;
            };
            if request.time < horizon {
                break;
            }
            if !request.automated {
                self.merge_observation(&request.host, request.time);
            }
        }
    }

    /// Combined-log-format fallback for when the proxy container is gone.
    async fn scan_access_logs(&self, dir: &Path, now: DateTime<Utc>) {
        let combined = match Regex::new(COMBINED_LOG_PATTERN) {
            Ok(re) => re,
            Err(e) => {
                self.logger
                    .error("detector", &format!("combined-log regex: {e}"));
                return;
            }
        };
        let (path_re, agent_re) = match automated_filters() {
            Ok(res) => res,
            Err(e) => {
                self.logger.error("detector", &format!("filter regex: {e}"));
                return;
            }
        };
        let horizon = now - chrono::Duration::seconds(SCAN_HORIZON_SECS);

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                self.logger.debug(
                    "detector",
                    &format!("access log dir {} unreadable: {e}", dir.display()),
                );
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    self.logger.debug(
                        "detector",
                        &format!("access log {} unreadable: {e}", path.display()),
                    );
                    continue;
                }
            };

            let lines: Vec<&str> = content.lines().collect();
            let tail_start = lines.len().saturating_sub(PROXY_LOG_TAIL_LINES);
            for line in lines[tail_start..].iter().rev() {
                let Some((host, time, request_path, method, user_agent)) =
                    parse_combined_line(&combined, line)
                else {
                    continue;
                };
                if time < horizon {
                    break;
                }
                if !is_automated(&request_path, &method, &user_agent, &path_re, &agent_re) {
                    self.merge_observation(&host, time);
                }
            }
        }
    }

    fn timestamp_path(&self, host: &str) -> PathBuf {
        self.timestamp_dir
            .join(format!("{TIMESTAMP_FILE_PREFIX}{}", sanitize_hostname(host)))
    }

    async fn read_timestamp_file(&self, host: &str) -> Option<DateTime<Utc>> {
        let path = self.timestamp_path(host);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        parse_timestamp(content.trim())
    }

    async fn timestamp_file_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.timestamp_dir).await else {
            return hosts;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(host) = name.strip_prefix(TIMESTAMP_FILE_PREFIX) {
                    if !host.is_empty() {
                        hosts.push(host.to_string());
                    }
                }
            }
        }
        hosts
    }
}

/// Timestamp files hold RFC3339; integer epoch seconds are accepted for
/// writers that predate that format.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    let epoch: i64 = raw.parse().ok()?;
    DateTime::from_timestamp(epoch, 0)
}

fn automated_filters() -> Result<(Regex, Regex), regex::Error> {
    Ok((
        Regex::new(AUTOMATED_PATH_PATTERN)?,
        Regex::new(AUTOMATED_AGENT_PATTERN)?,
    ))
}

/// Request records that do not represent a human visit: probes, bots, ACME
/// traffic, and bodyless preflight.
fn is_automated(path: &str, method: &str, user_agent: &str, path_re: &Regex, agent_re: &Regex) -> bool {
    if path_re.is_match(path) {
        return true;
    }
    if path.starts_with("/.well-known/acme-challenge/") {
        return true;
    }
    if user_agent.is_empty() {
        return true;
    }
    if method.eq_ignore_ascii_case("HEAD") {
        return true;
    }
    agent_re.is_match(user_agent)
}

/// Parse one proxy log line. Only JSON records with `msg == "Request"` count;
/// anything malformed is skipped rather than failing the scan.
fn parse_request_record(line: &str, path_re: &Regex, agent_re: &Regex) -> Option<ProxyRequest> {
    let json: Value = serde_json::from_str(line).ok()?;
    if json.get("msg").and_then(Value::as_str) != Some("Request") {
        return None;
    }

    let host = json.get("host").and_then(Value::as_str)?.to_string();
    let time = json
        .get("time")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?
        .with_timezone(&Utc);
    let path = json.get("path").and_then(Value::as_str).unwrap_or("");
    let method = json.get("method").and_then(Value::as_str).unwrap_or("");
    let user_agent = json.get("user_agent").and_then(Value::as_str).unwrap_or("");

    Some(ProxyRequest {
        automated: is_automated(path, method, user_agent, path_re, agent_re),
        host,
        time,
    })
}

/// Parse one combined-log-format line into (host, time, path, method, agent).
/// The hostname comes from the trailing vhost field when present, otherwise
/// from the request path.
fn parse_combined_line(
    combined: &Regex,
    line: &str,
) -> Option<(String, DateTime<Utc>, String, String, String)> {
    let captures = combined.captures(line)?;
    let time = DateTime::parse_from_str(captures.get(2)?.as_str(), "%d/%b/%Y:%H:%M:%S %z")
        .ok()?
        .with_timezone(&Utc);
    let method = captures.get(3)?.as_str().to_string();
    let path = captures.get(4)?.as_str().to_string();
    let user_agent = captures
        .get(6)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    let host = captures
        .get(7)
        .map(|m| m.as_str().to_string())
        .or_else(|| host_from_path(&path))?;

    Some((host, time, path, method, user_agent))
}

/// Absolute-form request targets carry the hostname themselves; otherwise a
/// leading path segment that looks like a DNS name is taken as one.
fn host_from_path(path: &str) -> Option<String> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return url::Url::parse(path)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()));
    }
    let first = path.trim_start_matches('/').split('/').next()?;
    if first.contains('.') {
        Some(first.to_string())
    } else {
        None
    }
}
