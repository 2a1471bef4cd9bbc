// Container runtime and proxy commands with retry, plus app discovery.
use crate::config::Config;
use crate::core::logger::Logger;
use crate::core::types::CommandError;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one external command attempt.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Process spawning abstraction so the Runner is testable without a
/// container runtime on the box.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Spawn `program` with `args`, wait for it, and report exit code and
    /// captured output. `Err` is reserved for spawn failures.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, String>;
}

/// Production executor backed by tokio::process.
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, String> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to spawn {program}: {e}"))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Scripted executor for tests. Stubs match on a substring of the joined
/// command line, first match wins; unmatched commands succeed with empty
/// output. Every invocation is recorded.
#[derive(Default)]
pub struct MockCommandExecutor {
    stubs: std::sync::Mutex<Vec<(String, CommandOutput)>>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stub(&self, needle: &str, output: CommandOutput) {
        self.stubs
            .lock()
            .expect("mock stubs poisoned")
            .push((needle.to_string(), output));
    }

    /// Full command lines observed so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock calls poisoned").clone()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

#[async_trait::async_trait]
impl CommandExecutor for MockCommandExecutor {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, String> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls
            .lock()
            .expect("mock calls poisoned")
            .push(line.clone());

        let stubs = self.stubs.lock().expect("mock stubs poisoned");
        for (needle, output) in stubs.iter() {
            if line.contains(needle.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput::ok(""))
    }
}

/// One container as reported by the runtime.
#[derive(Debug, Clone)]
struct ContainerInfo {
    name: String,
    state: String,
}

/// An app the runtime knows about, keyed by hostname in discovery results.
#[derive(Debug, Clone)]
pub struct DiscoveredApp {
    pub service: String,
    pub container_name: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Issues start/stop/maintenance operations against docker and kamal-proxy.
/// Everything externally visible goes through the retry wrapper; the retry
/// cap bounds how long any one operation can block a tick.
pub struct Runner {
    executor: Arc<dyn CommandExecutor>,
    logger: Arc<Logger>,
    max_retries: u32,
    proxy_container: String,
}

impl Runner {
    pub fn new(executor: Arc<dyn CommandExecutor>, logger: Arc<Logger>, config: &Config) -> Self {
        Self {
            executor,
            logger,
            max_retries: config.max_retries,
            proxy_container: config.proxy_container_name.clone(),
        }
    }

    /// Service label for a host: its first dot-separated component.
    pub fn service_for_host(host: &str) -> &str {
        host.split('.').next().unwrap_or(host)
    }

    /// Run a command with up to `max_retries` extra attempts, sleeping
    /// `2^attempt` seconds between them. A zero exit wins immediately.
    async fn execute_with_retry(
        &self,
        description: &str,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, CommandError> {
        let attempts = self.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.executor.run(program, args).await {
                Ok(output) if output.success() => return Ok(output),
                Ok(output) => {
                    last_error = format!(
                        "exit {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    );
                }
                Err(e) => last_error = e,
            }

            self.logger.warn(
                "runner",
                &format!("{description} attempt {attempt}/{attempts} failed: {last_error}"),
            );
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
            }
        }

        Err(CommandError::RetriesExhausted {
            command: description.to_string(),
            attempts,
            last_error,
        })
    }

    async fn list_service_containers(
        &self,
        service: &str,
    ) -> Result<Vec<ContainerInfo>, CommandError> {
        let args = string_args(&[
            "ps",
            "-a",
            "--filter",
            &format!("label=service={service}"),
            "--format",
            "{{.Names}}\t{{.State}}",
        ]);
        let output = self
            .execute_with_retry(&format!("list containers for {service}"), "docker", &args)
            .await?;

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split('\t');
                let name = parts.next()?.trim();
                let state = parts.next()?.trim();
                if name.is_empty() {
                    return None;
                }
                Some(ContainerInfo {
                    name: name.to_string(),
                    state: state.to_lowercase(),
                })
            })
            .collect())
    }

    /// Start the first Exited/Created container of the host's service.
    /// Returns false (without error) when no candidate exists.
    pub async fn start_app_container(&self, host: &str) -> Result<bool, CommandError> {
        let service = Self::service_for_host(host);
        let containers = self.list_service_containers(service).await?;

        let candidate = containers
            .iter()
            .find(|c| c.state == "exited" || c.state == "created");
        let Some(container) = candidate else {
            self.logger.warn(
                "runner",
                &format!("no stopped container found for service {service}"),
            );
            return Ok(false);
        };

        self.logger.info(
            "runner",
            &format!("starting container {} for {host}", container.name),
        );
        self.execute_with_retry(
            &format!("start {}", container.name),
            "docker",
            &string_args(&["start", &container.name]),
        )
        .await?;
        Ok(true)
    }

    /// Stop the first running container of the host's service. Returns false
    /// (without error) when none is running.
    pub async fn stop_app_container(&self, host: &str) -> Result<bool, CommandError> {
        let service = Self::service_for_host(host);
        let containers = self.list_service_containers(service).await?;

        let candidate = containers.iter().find(|c| c.state == "running");
        let Some(container) = candidate else {
            self.logger.debug(
                "runner",
                &format!("no running container found for service {service}"),
            );
            return Ok(false);
        };

        self.logger.info(
            "runner",
            &format!("stopping container {} for {host}", container.name),
        );
        self.execute_with_retry(
            &format!("stop {}", container.name),
            "docker",
            &string_args(&["stop", &container.name]),
        )
        .await?;
        Ok(true)
    }

    /// Hard-kill the host's container. Failure is tolerated: this is already
    /// the fallback path.
    pub async fn force_stop_app_container(&self, host: &str) {
        let service = Self::service_for_host(host);
        let containers = match self.list_service_containers(service).await {
            Ok(containers) => containers,
            Err(e) => {
                self.logger
                    .warn("runner", &format!("force-stop {host}: {e}"));
                return;
            }
        };
        let Some(container) = containers.iter().find(|c| c.state == "running") else {
            return;
        };

        self.logger.warn(
            "runner",
            &format!("force-killing container {} for {host}", container.name),
        );
        if let Err(e) = self
            .execute_with_retry(
                &format!("kill {}", container.name),
                "docker",
                &string_args(&["kill", &container.name]),
            )
            .await
        {
            self.logger
                .warn("runner", &format!("force-stop {host}: {e}"));
        }
    }

    /// Toggle kamal-proxy maintenance for the host's service. Errors are
    /// logged and swallowed; maintenance must never abort a lifecycle step.
    pub async fn set_maintenance(&self, host: &str, enabled: bool) {
        let service = Self::service_for_host(host).to_string();
        let verb = if enabled { "pause" } else { "resume" };
        let args = string_args(&["exec", &self.proxy_container, "kamal-proxy", verb, &service]);

        match self
            .execute_with_retry(&format!("{verb} {service}"), "docker", &args)
            .await
        {
            Ok(_) => self.logger.info(
                "runner",
                &format!("maintenance {} for {host}", if enabled { "on" } else { "off" }),
            ),
            Err(e) => self
                .logger
                .warn("runner", &format!("maintenance toggle for {host}: {e}")),
        }
    }

    /// Bounded read of the proxy container's stdout; None when the proxy is
    /// unavailable so callers can fall back to access-log files.
    pub async fn proxy_log_tail(&self, lines: usize) -> Option<String> {
        let args = string_args(&[
            "logs",
            "--tail",
            &lines.to_string(),
            &self.proxy_container,
        ]);
        match self
            .execute_with_retry("tail proxy log", "docker", &args)
            .await
        {
            // kamal-proxy writes its access log to stderr; take both streams
            Ok(output) if output.stdout.is_empty() => Some(output.stderr),
            Ok(output) => Some(output.stdout),
            Err(e) => {
                self.logger
                    .debug("runner", &format!("proxy log unavailable: {e}"));
                None
            }
        }
    }

    /// Inventory the runtime for managed apps: containers with a `service`
    /// label (skipping the proxy itself), plus hostnames the proxy log
    /// mentions in routing rules. Failures yield a partial or empty map.
    pub async fn discover_kamal_apps(&self) -> HashMap<String, DiscoveredApp> {
        let mut apps = HashMap::new();

        let host_rule = match Regex::new(r"Host\(`([^`]+)`\)") {
            Ok(re) => re,
            Err(e) => {
                self.logger
                    .error("runner", &format!("discovery regex: {e}"));
                return apps;
            }
        };

        let args = string_args(&[
            "ps",
            "--filter",
            "label=service",
            "--format",
            "{{.Names}}\t{{.Labels}}",
        ]);
        match self
            .execute_with_retry("list labeled containers", "docker", &args)
            .await
        {
            Ok(output) => {
                for line in output.stdout.lines() {
                    let Some((name, labels_raw)) = line.split_once('\t') else {
                        continue;
                    };
                    let labels = parse_labels(labels_raw);
                    let Some(service) = labels.get("service").cloned() else {
                        continue;
                    };
                    if name == self.proxy_container
                        || labels.get("role").map(String::as_str) == Some("proxy")
                    {
                        continue;
                    }

                    let host = host_rule
                        .captures(labels_raw)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_else(|| synthesize_hostname(&service));

                    apps.entry(host).or_insert(DiscoveredApp {
                        service,
                        container_name: Some(name.to_string()),
                        labels,
                    });
                }
            }
            Err(e) => {
                self.logger
                    .warn("runner", &format!("container discovery failed: {e}"));
            }
        }

        // Routing rules seen in the proxy log cover apps whose containers are
        // currently gone (stopped and pruned) but still routed.
        if let Some(tail) = self.proxy_log_tail(500).await {
            for captures in host_rule.captures_iter(&tail) {
                if let Some(host) = captures.get(1) {
                    let host = host.as_str().to_string();
                    apps.entry(host.clone()).or_insert_with(|| DiscoveredApp {
                        service: Self::service_for_host(&host).to_string(),
                        container_name: None,
                        labels: HashMap::new(),
                    });
                }
            }
        }

        apps
    }
}

fn string_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// A service with no routing rule still needs a stable map key; hosts made
/// up this way only survive the hostname validity filter when the service
/// name itself looks like a DNS name.
fn synthesize_hostname(service: &str) -> String {
    if service.contains('.') {
        service.to_string()
    } else {
        format!("{service}.local")
    }
}
