// Control loop: discovery, per-host state advancement, persistence.
use crate::config::Config;
use crate::core::app_state::AppState;
use crate::core::clock::Clock;
use crate::core::detector::RequestDetector;
use crate::core::health::HealthChecker;
use crate::core::logger::Logger;
use crate::core::persistence::StatePersistence;
use crate::core::runner::Runner;
use crate::core::types::{valid_hostname, AppSummary, LifecycleState, StateError, StatusSnapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Seconds a Stopping app may stay healthy before it is force-killed.
const STOP_GRACE_SECS: i64 = 30;

/// Owns the authoritative host -> AppState map and advances it every tick.
/// The supervisor is the only writer; detector, health checker, and runner
/// are observers and side-effect executors it invokes.
///
/// Error policy: everything is caught at the per-host boundary. A guard
/// violation resets the offending app; command failures take the documented
/// fallback; nothing stops the loop short of process shutdown.
pub struct Supervisor {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    logger: Arc<Logger>,
    detector: Arc<RequestDetector>,
    health: Arc<HealthChecker>,
    runner: Arc<Runner>,
    persistence: Arc<StatePersistence>,
    apps: Mutex<HashMap<String, AppState>>,
    running: AtomicBool,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    sync_counter: AtomicU64,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        logger: Arc<Logger>,
        detector: Arc<RequestDetector>,
        health: Arc<HealthChecker>,
        runner: Arc<Runner>,
        persistence: Arc<StatePersistence>,
    ) -> Self {
        Self {
            config,
            clock,
            logger,
            detector,
            health,
            runner,
            persistence,
            apps: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            sync_counter: AtomicU64::new(0),
        }
    }

    /// Seed the map from the persisted snapshot. Hosts that no longer pass
    /// the validity predicate (e.g. own_hostname changed) are dropped here.
    pub async fn load_persisted(&self) {
        let now = self.clock.now();
        let restored = self.persistence.load(now);
        let own = self.config.own_hostname.as_deref();

        let mut apps = self.apps.lock().await;
        for (host, app) in restored {
            if valid_hostname(&host, own) {
                apps.insert(host, app);
            } else {
                self.logger
                    .warn("supervisor", &format!("dropping restored host {host}"));
            }
        }
    }

    /// Run ticks until shutdown is requested, then persist and return.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.logger.info(
            "supervisor",
            &format!(
                "control loop started (poll every {}s, idle timeout {}s)",
                self.config.poll_interval, self.config.idle_timeout
            ),
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            self.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = self.shutdown_notify.notified() => {}
            }
        }

        self.persist().await;
        self.running.store(false, Ordering::SeqCst);
        self.logger.info("supervisor", "control loop stopped");
    }

    /// Ask the loop to exit after its current per-host step.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// One control-loop iteration: discover, manage every host, persist.
    pub async fn tick(&self) {
        self.discover().await;

        let mut hosts: Vec<String> = {
            let apps = self.apps.lock().await;
            apps.keys().cloned().collect()
        };
        hosts.sort();

        for host in hosts {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.manage_app(&host).await;
        }

        self.persist().await;
    }

    /// Build the universe of hosts from traffic and container inventory and
    /// create AppStates for the ones not tracked yet. Fresh entries that are
    /// already answering health checks start out as Running.
    async fn discover(&self) {
        let mut universe: BTreeSet<String> =
            self.detector.detected_hostnames().await.into_iter().collect();
        universe.extend(self.runner.discover_kamal_apps().await.into_keys());

        let own = self.config.own_hostname.as_deref();
        for host in universe {
            if !valid_hostname(&host, own) {
                continue;
            }
            let tracked = { self.apps.lock().await.contains_key(&host) };
            if tracked {
                continue;
            }

            let healthy = self.health.healthy(&host, None, None, None).await;
            let now = self.clock.now();
            let mut app = AppState::new(host.clone(), now);
            if healthy {
                app.force_transition_to(LifecycleState::Running, "initial_state_sync", now);
            }
            self.logger.info(
                "supervisor",
                &format!("discovered {host} ({})", app.current_state()),
            );
            self.apps.lock().await.entry(host).or_insert(app);
        }
    }

    /// Per-host tick step: sampled state sync, then one advance. Errors are
    /// contained here so one misbehaving host cannot stop the loop.
    async fn manage_app(&self, host: &str) {
        if self.should_sample_sync() {
            self.state_sync(host).await;
        }

        if let Err(e) = self.advance(host).await {
            self.logger.error(
                "supervisor",
                &format!("advance failed for {host}: {e}; resetting"),
            );
            let now = self.clock.now();
            if let Some(app) = self.apps.lock().await.get_mut(host) {
                app.reset(now);
            }
        }
    }

    /// Reconcile tracked state with observed container liveness.
    async fn state_sync(&self, host: &str) {
        let active = {
            match self.apps.lock().await.get(host) {
                Some(app) => app.active(),
                None => return,
            }
        };
        let healthy = self.health.healthy(host, None, None, None).await;
        if healthy == active {
            return;
        }

        let now = self.clock.now();
        let mut apps = self.apps.lock().await;
        let Some(app) = apps.get_mut(host) else {
            return;
        };
        if healthy && !app.active() {
            self.logger.warn(
                "supervisor",
                &format!("{host} is healthy but tracked as {}", app.current_state()),
            );
            app.force_transition_to(LifecycleState::Running, "state_sync_correction", now);
        } else if !healthy && app.active() {
            self.logger.warn(
                "supervisor",
                &format!("{host} is unresponsive but tracked as {}", app.current_state()),
            );
            app.force_transition_to(LifecycleState::Stopped, "state_sync_correction", now);
        }
    }

    /// Advance one host through the lifecycle table.
    async fn advance(&self, host: &str) -> Result<(), StateError> {
        let view = {
            match self.apps.lock().await.get(host) {
                Some(app) => app.clone(),
                None => return Ok(()),
            }
        };
        let now = self.clock.now();

        match view.current_state() {
            LifecycleState::Stopped => {
                if self
                    .detector
                    .recent_requests(host, self.config.idle_timeout())
                    .await
                {
                    self.logger
                        .info("supervisor", &format!("traffic returned for {host}"));
                    self.start_app(host).await?;
                }
            }
            LifecycleState::Starting => {
                if self.health.healthy(host, None, None, None).await {
                    self.runner.set_maintenance(host, false).await;
                    self.apply_transition(host, LifecycleState::Running).await?;
                    self.logger.info("supervisor", &format!("{host} is up"));
                } else if let Some(started) = view.startup_started_at() {
                    let waited = (now - started).num_seconds();
                    if waited >= self.config.startup_timeout as i64 {
                        self.logger.warn(
                            "supervisor",
                            &format!("{host} failed to start within {waited}s"),
                        );
                        self.runner.set_maintenance(host, false).await;
                        self.apply_forced(host, LifecycleState::Stopped, "startup_timeout")
                            .await;
                    }
                }
            }
            LifecycleState::Running => {
                if !self
                    .detector
                    .recent_requests(host, self.config.idle_timeout())
                    .await
                {
                    self.apply_transition(host, LifecycleState::Idle).await?;
                }
            }
            LifecycleState::Idle => {
                if self
                    .detector
                    .recent_requests(host, self.config.idle_timeout())
                    .await
                {
                    self.apply_transition(host, LifecycleState::Running).await?;
                } else if view.seconds_in_state(now) >= self.config.idle_timeout as i64 {
                    self.logger.info(
                        "supervisor",
                        &format!("{host} idle for {}s, stopping", view.seconds_in_state(now)),
                    );
                    self.apply_transition(host, LifecycleState::Stopping).await?;
                    self.stop_app(host).await;
                }
            }
            LifecycleState::Stopping => {
                if !self.health.healthy(host, None, None, None).await {
                    self.apply_transition(host, LifecycleState::Stopped).await?;
                    self.logger.info("supervisor", &format!("{host} stopped"));
                } else if view.seconds_in_state(now) > STOP_GRACE_SECS {
                    self.logger.warn(
                        "supervisor",
                        &format!("{host} still healthy after stop; force-killing"),
                    );
                    self.runner.force_stop_app_container(host).await;
                    self.apply_forced(host, LifecycleState::Stopped, "stop_timeout")
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Stopped -> Starting side-effect path: maintenance on, container start.
    /// Returns whether the app actually entered Starting.
    async fn start_app(&self, host: &str) -> Result<bool, StateError> {
        self.runner.set_maintenance(host, true).await;

        match self.runner.start_app_container(host).await {
            Ok(true) => {
                self.apply_transition(host, LifecycleState::Starting).await?;
                Ok(true)
            }
            Ok(false) => {
                self.logger.warn(
                    "supervisor",
                    &format!("{host}: no container available to start"),
                );
                self.runner.set_maintenance(host, false).await;
                Ok(false)
            }
            Err(e) => {
                self.logger
                    .error("supervisor", &format!("start failed for {host}: {e}"));
                self.runner.set_maintenance(host, false).await;
                self.apply_forced(host, LifecycleState::Stopped, "start_failed")
                    .await;
                Ok(false)
            }
        }
    }

    /// Issue the stop command; on exhausted retries fall back to a hard kill.
    async fn stop_app(&self, host: &str) {
        if let Err(e) = self.runner.stop_app_container(host).await {
            self.logger
                .error("supervisor", &format!("stop failed for {host}: {e}"));
            self.runner.force_stop_app_container(host).await;
            self.apply_forced(host, LifecycleState::Stopped, "stop_failed")
                .await;
        }
    }

    async fn apply_transition(&self, host: &str, to: LifecycleState) -> Result<(), StateError> {
        let now = self.clock.now();
        match self.apps.lock().await.get_mut(host) {
            Some(app) => app.transition_to(to, now),
            None => Ok(()),
        }
    }

    async fn apply_forced(&self, host: &str, to: LifecycleState, reason: &str) {
        let now = self.clock.now();
        if let Some(app) = self.apps.lock().await.get_mut(host) {
            app.force_transition_to(to, reason, now);
        }
    }

    /// State sync is sampled, not per-tick: fires once per
    /// `state_sync_sample_rate` per-host checks.
    fn should_sample_sync(&self) -> bool {
        let rate = self.config.state_sync_sample_rate.max(1);
        if rate == 1 {
            return true;
        }
        self.sync_counter.fetch_add(1, Ordering::Relaxed) % rate == 0
    }

    /// Flush a copy of the map to disk; the lock is not held across the
    /// write. Save failures are logged and the loop carries on.
    async fn persist(&self) {
        let copy = { self.apps.lock().await.clone() };
        let now = self.clock.now();
        if let Err(e) = self.persistence.save(&copy, now) {
            self.logger
                .error("supervisor", &format!("state save failed: {e}"));
        }
    }

    // External mutations, callable concurrently with the tick.

    /// Start a Stopped app on demand. True iff the app entered Starting.
    /// Any other state (or unknown host) is a no-op returning false.
    pub async fn wake_app(&self, host: &str) -> bool {
        let state = {
            self.apps
                .lock()
                .await
                .get(host)
                .map(|app| app.current_state())
        };
        match state {
            Some(LifecycleState::Stopped) => self.start_app(host).await.unwrap_or(false),
            _ => false,
        }
    }

    /// Force an active app down the stopping path. True iff it was active.
    pub async fn sleep_app(&self, host: &str) -> bool {
        let active = {
            self.apps
                .lock()
                .await
                .get(host)
                .map(|app| app.active())
                .unwrap_or(false)
        };
        if !active {
            return false;
        }

        if self
            .apply_transition(host, LifecycleState::Stopping)
            .await
            .is_err()
        {
            return false;
        }
        self.stop_app(host).await;
        true
    }

    /// Stop every active app; returns how many were acted on.
    pub async fn stop_all_apps(&self) -> usize {
        let hosts: Vec<String> = {
            self.apps
                .lock()
                .await
                .iter()
                .filter(|(_, app)| app.active())
                .map(|(host, _)| host.clone())
                .collect()
        };

        let mut stopped = 0;
        for host in hosts {
            if self.sleep_app(&host).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Track a host explicitly. False when invalid or already tracked.
    pub async fn add_app(&self, host: &str) -> bool {
        if !valid_hostname(host, self.config.own_hostname.as_deref()) {
            return false;
        }
        let now = self.clock.now();
        let mut apps = self.apps.lock().await;
        if apps.contains_key(host) {
            return false;
        }
        apps.insert(host.to_string(), AppState::new(host, now));
        drop(apps);

        self.logger.info("supervisor", &format!("added {host}"));
        self.persist().await;
        true
    }

    /// Untrack a host, stopping it first when active. False when unknown.
    pub async fn remove_app(&self, host: &str) -> bool {
        let exists = { self.apps.lock().await.contains_key(host) };
        if !exists {
            return false;
        }

        self.sleep_app(host).await;
        self.apps.lock().await.remove(host);
        self.logger.info("supervisor", &format!("removed {host}"));
        self.persist().await;
        true
    }

    /// Deep-copied status snapshot; safe to serialize after the lock is gone.
    pub async fn status(&self) -> StatusSnapshot {
        let summaries: Vec<(String, LifecycleState, chrono::DateTime<chrono::Utc>, Option<chrono::DateTime<chrono::Utc>>)> = {
            self.apps
                .lock()
                .await
                .values()
                .map(|app| {
                    (
                        app.hostname().to_string(),
                        app.current_state(),
                        app.state_changed_at(),
                        app.startup_started_at(),
                    )
                })
                .collect()
        };

        let mut apps = BTreeMap::new();
        for (host, state, state_changed_at, startup_started_at) in summaries {
            let last_request_at = self.detector.last_request_time(&host).await;
            apps.insert(
                host,
                AppSummary {
                    state,
                    state_changed_at,
                    startup_started_at,
                    last_request_at,
                },
            );
        }

        StatusSnapshot {
            running: self.running.load(Ordering::SeqCst),
            app_count: apps.len(),
            poll_interval: self.config.poll_interval,
            apps,
        }
    }
}
