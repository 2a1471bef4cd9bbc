//! Common test utilities: a manually advanced clock, config fixtures, and a
//! supervisor harness wired entirely with mocks.
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use kamal_napper::config::Config;
use kamal_napper::core::app_state::AppState;
use kamal_napper::core::clock::Clock;
use kamal_napper::core::detector::RequestDetector;
use kamal_napper::core::health::{HealthChecker, MockHealthCheckClient};
use kamal_napper::core::logger::Logger;
use kamal_napper::core::persistence::StatePersistence;
use kamal_napper::core::runner::{CommandOutput, MockCommandExecutor, Runner};
use kamal_napper::core::supervisor::Supervisor;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Fixed origin for deterministic tests: 2026-08-01T12:00:00Z.
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
        .expect("valid fixture timestamp")
        .with_timezone(&Utc)
}

/// Manually advanced clock so timer-driven transitions are deterministic.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += chrono::Duration::seconds(secs);
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.lock().expect("clock poisoned") = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock poisoned")
    }
}

pub fn test_logger() -> Arc<Logger> {
    Arc::new(Logger::new("error", None))
}

pub fn create_temp_dir() -> TempDir {
    tempfile::tempdir().expect("failed to create temp directory")
}

/// Config tuned for tests: short timers, no retries, state sync effectively
/// disabled unless a test opts in.
pub fn test_config(state_dir: &Path) -> Config {
    Config {
        idle_timeout: 60,
        poll_interval: 1,
        startup_timeout: 60,
        max_retries: 0,
        health_check_port: 80,
        health_check_path: "/health".to_string(),
        health_check_timeout: 1,
        state_dir: state_dir.to_path_buf(),
        own_hostname: None,
        log_level: "error".to_string(),
        log_file: None,
        proxy_container_name: "kamal-proxy".to_string(),
        access_log_dir: None,
        state_sync_sample_rate: 1_000_000,
    }
}

/// A supervisor with every collaborator mocked, plus handles to script the
/// mocks and steer the clock.
pub struct Harness {
    pub temp: TempDir,
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub executor: Arc<MockCommandExecutor>,
    pub health_client: Arc<MockHealthCheckClient>,
    pub detector: Arc<RequestDetector>,
    pub supervisor: Arc<Supervisor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let temp = create_temp_dir();
        let mut config = test_config(&temp.path().join("state"));
        customize(&mut config);

        let stamp_dir = temp.path().join("stamps");
        std::fs::create_dir_all(&stamp_dir).expect("create stamp dir");

        let logger = test_logger();
        let clock = Arc::new(ManualClock::new(t0()));
        let executor = Arc::new(MockCommandExecutor::new());
        let runner = Arc::new(Runner::new(executor.clone(), logger.clone(), &config));
        let detector = Arc::new(RequestDetector::with_timestamp_dir(
            runner.clone(),
            logger.clone(),
            clock.clone(),
            &config,
            stamp_dir,
        ));
        let health_client = Arc::new(MockHealthCheckClient::new(false));
        let health = Arc::new(HealthChecker::new(
            health_client.clone(),
            logger.clone(),
            &config,
        ));
        let persistence = Arc::new(
            StatePersistence::new(&config.state_dir, logger.clone()).expect("state dir"),
        );

        let supervisor = Arc::new(Supervisor::new(
            Arc::new(config.clone()),
            clock.clone(),
            logger,
            detector.clone(),
            health,
            runner,
            persistence,
        ));

        Self {
            temp,
            config,
            clock,
            executor,
            health_client,
            detector,
            supervisor,
        }
    }

    /// Seed tracked apps by writing a snapshot and restoring it, the same
    /// path a daemon restart takes.
    pub async fn seed(&self, apps: Vec<AppState>) {
        let persistence =
            StatePersistence::new(&self.config.state_dir, test_logger()).expect("state dir");
        let map: HashMap<String, AppState> = apps
            .into_iter()
            .map(|app| (app.hostname().to_string(), app))
            .collect();
        persistence.save(&map, self.clock.now()).expect("seed save");
        self.supervisor.load_persisted().await;
    }

    /// Script `docker ps -a --filter label=service=<service>` to report one
    /// container in the given state.
    pub fn stub_service_container(&self, service: &str, name: &str, state: &str) {
        self.executor.stub(
            &format!("label=service={service}"),
            CommandOutput::ok(format!("{name}\t{state}")),
        );
    }

    /// Script the proxy log tail returned by `docker logs`.
    pub fn stub_proxy_log(&self, lines: &str) {
        self.executor.stub("logs --tail", CommandOutput::ok(lines));
    }

    /// Drop a timestamp file the way an out-of-band client would.
    pub fn write_timestamp_file(&self, host: &str, t: DateTime<Utc>) {
        let path = self
            .temp
            .path()
            .join("stamps")
            .join(format!("kamal_napper_last_request_{host}"));
        std::fs::write(path, t.to_rfc3339()).expect("write timestamp file");
    }

    /// A proxy request log line as kamal-proxy emits it.
    pub fn request_line(
        &self,
        host: &str,
        path: &str,
        method: &str,
        user_agent: &str,
        time: DateTime<Utc>,
    ) -> String {
        format!(
            r#"{{"time":"{}","level":"INFO","msg":"Request","host":"{}","port":443,"path":"{}","method":"{}","status":200,"user_agent":"{}"}}"#,
            time.to_rfc3339(),
            host,
            path,
            method,
            user_agent
        )
    }
}
