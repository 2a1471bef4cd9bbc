// HTTP health probing of managed apps through an injectable client.
use crate::config::Config;
use crate::core::logger::Logger;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use isahc::config::{Configurable, RedirectPolicy};
use isahc::{HttpClient, Request};

/// Response slice a health decision needs: status and timing only.
#[derive(Debug, Clone)]
pub struct HealthResponse {
    pub status_code: u16,
    pub duration: Duration,
}

/// HTTP client abstraction for health probes.
///
/// Implementations must use GET, honor the timeout over connect + read, and
/// not follow redirects; a 3xx is reported as-is and counts as responding.
#[async_trait::async_trait]
pub trait HealthCheckClient: Send + Sync {
    async fn get(&self, url: String, timeout: Duration) -> Result<HealthResponse, String>;
}

/// Production client backed by isahc.
pub struct IsahcHealthCheckClient {
    client: HttpClient,
}

impl IsahcHealthCheckClient {
    pub fn new() -> Result<Self, String> {
        let client = HttpClient::builder()
            .redirect_policy(RedirectPolicy::None)
            .build()
            .map_err(|e| format!("failed to create health check client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl HealthCheckClient for IsahcHealthCheckClient {
    async fn get(&self, url: String, timeout: Duration) -> Result<HealthResponse, String> {
        let start = std::time::Instant::now();

        let request = Request::get(&url)
            .timeout(timeout)
            .header("User-Agent", concat!("kamal-napper/", env!("CARGO_PKG_VERSION")))
            .body(())
            .map_err(|e| format!("health request creation failed: {e}"))?;

        let response = self
            .client
            .send_async(request)
            .await
            .map_err(|e| format!("health request failed: {e}"))?;

        Ok(HealthResponse {
            status_code: response.status().as_u16(),
            duration: start.elapsed(),
        })
    }
}

/// Scripted client for tests: per-host healthy/unhealthy verdicts plus a
/// default for unknown hosts.
#[derive(Default)]
pub struct MockHealthCheckClient {
    verdicts: std::sync::Mutex<HashMap<String, bool>>,
    default_healthy: std::sync::atomic::AtomicBool,
}

impl MockHealthCheckClient {
    pub fn new(default_healthy: bool) -> Self {
        Self {
            verdicts: std::sync::Mutex::new(HashMap::new()),
            default_healthy: std::sync::atomic::AtomicBool::new(default_healthy),
        }
    }

    /// Script the verdict for one host (matched against the URL's host part).
    pub fn set_healthy(&self, host: &str, healthy: bool) {
        self.verdicts
            .lock()
            .expect("mock verdicts poisoned")
            .insert(host.to_string(), healthy);
    }
}

#[async_trait::async_trait]
impl HealthCheckClient for MockHealthCheckClient {
    async fn get(&self, url: String, _timeout: Duration) -> Result<HealthResponse, String> {
        let host = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();
        let healthy = self
            .verdicts
            .lock()
            .expect("mock verdicts poisoned")
            .get(&host)
            .copied()
            .unwrap_or(self.default_healthy.load(std::sync::atomic::Ordering::SeqCst));
        if healthy {
            Ok(HealthResponse {
                status_code: 200,
                duration: Duration::from_millis(5),
            })
        } else {
            Err("connection refused".to_string())
        }
    }
}

/// Diagnostic variant of a health verdict.
#[derive(Debug, Clone)]
pub struct HealthInfo {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Answers "is the container responding?" for one host. Every failure class
/// (refused, unreachable, DNS, timeout) maps to false; nothing escapes.
pub struct HealthChecker {
    client: Arc<dyn HealthCheckClient>,
    logger: Arc<Logger>,
    default_port: u16,
    default_path: String,
    default_timeout: Duration,
}

impl HealthChecker {
    pub fn new(client: Arc<dyn HealthCheckClient>, logger: Arc<Logger>, config: &Config) -> Self {
        Self {
            client,
            logger,
            default_port: config.health_check_port,
            default_path: config.health_check_path.clone(),
            default_timeout: config.health_check_timeout(),
        }
    }

    /// True iff an HTTP response with status < 400 arrives before the
    /// deadline.
    pub async fn healthy(
        &self,
        host: &str,
        port: Option<u16>,
        path: Option<&str>,
        timeout: Option<Duration>,
    ) -> bool {
        self.health_info(host, port, path, timeout).await.healthy
    }

    /// Same verdict plus timing, status code, and error text for diagnostics.
    pub async fn health_info(
        &self,
        host: &str,
        port: Option<u16>,
        path: Option<&str>,
        timeout: Option<Duration>,
    ) -> HealthInfo {
        let port = port.unwrap_or(self.default_port);
        let path = path.unwrap_or(&self.default_path);
        let timeout = timeout.unwrap_or(self.default_timeout);

        let url = match build_health_url(host, port, path) {
            Ok(url) => url,
            Err(e) => {
                self.logger
                    .debug("health", &format!("bad health url for {host}: {e}"));
                return HealthInfo {
                    healthy: false,
                    response_time_ms: 0,
                    status_code: None,
                    error: Some(e),
                };
            }
        };

        match self.client.get(url, timeout).await {
            Ok(response) => {
                let healthy = response.status_code < 400;
                if !healthy {
                    self.logger.debug(
                        "health",
                        &format!("{host} responded {}", response.status_code),
                    );
                }
                HealthInfo {
                    healthy,
                    response_time_ms: response.duration.as_millis() as u64,
                    status_code: Some(response.status_code),
                    error: None,
                }
            }
            Err(e) => {
                self.logger
                    .debug("health", &format!("{host} unreachable: {e}"));
                HealthInfo {
                    healthy: false,
                    response_time_ms: 0,
                    status_code: None,
                    error: Some(e),
                }
            }
        }
    }

    /// Poll at fixed `delay` intervals until healthy or `attempts` exhausted.
    pub async fn wait_for_health(&self, host: &str, attempts: u32, delay: Duration) -> bool {
        for attempt in 1..=attempts.max(1) {
            if self.healthy(host, None, None, None).await {
                return true;
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        false
    }
}

fn build_health_url(host: &str, port: u16, path: &str) -> Result<String, String> {
    let url = url::Url::parse(&format!("http://{host}:{port}{path}"))
        .map_err(|e| format!("invalid url: {e}"))?;
    Ok(url.to_string())
}
