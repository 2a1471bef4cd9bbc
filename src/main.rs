use kamal_napper::cli::Cli;
use kamal_napper::config::Config;
use kamal_napper::core::clock::{Clock, SystemClock};
use kamal_napper::core::detector::RequestDetector;
use kamal_napper::core::health::{HealthChecker, IsahcHealthCheckClient};
use kamal_napper::core::logger::Logger;
use kamal_napper::core::persistence::StatePersistence;
use kamal_napper::core::runner::{Runner, SystemCommandExecutor};
use kamal_napper::core::supervisor::Supervisor;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_args();

    // The configured logger depends on the config, so load-time problems
    // (malformed env overrides) go to a stderr-only bootstrap logger.
    let boot_logger = Logger::new("info", None);
    let mut config = Config::load(cli.config.as_deref(), &boot_logger)?;
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    config.validate()?;

    if cli.check_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let logger = Arc::new(Logger::new(&config.log_level, config.log_file.as_deref()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let runner = Arc::new(Runner::new(
        Arc::new(SystemCommandExecutor),
        logger.clone(),
        &config,
    ));
    let detector = Arc::new(RequestDetector::new(
        runner.clone(),
        logger.clone(),
        clock.clone(),
        &config,
    ));
    let health = Arc::new(HealthChecker::new(
        Arc::new(IsahcHealthCheckClient::new()?),
        logger.clone(),
        &config,
    ));
    // State dir creation failing here is the one unrecoverable init error
    let persistence = Arc::new(StatePersistence::new(&config.state_dir, logger.clone())?);
    persistence.cleanup_backups(5);

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(config),
        clock,
        logger.clone(),
        detector,
        health,
        runner,
        persistence,
    ));
    supervisor.load_persisted().await;

    spawn_signal_handlers(supervisor.clone(), logger.clone())?;

    supervisor.run().await;
    Ok(())
}

/// SIGTERM/SIGINT request a clean shutdown; SIGUSR1 dumps a status snapshot
/// to the log without interrupting the tick.
fn spawn_signal_handlers(
    supervisor: Arc<Supervisor>,
    logger: Arc<Logger>,
) -> Result<(), std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    {
        let supervisor = supervisor.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => logger.info("main", "received SIGTERM, shutting down"),
                _ = sigint.recv() => logger.info("main", "received SIGINT, shutting down"),
            }
            supervisor.request_shutdown();
        });
    }

    tokio::spawn(async move {
        while sigusr1.recv().await.is_some() {
            let snapshot = supervisor.status().await;
            match serde_json::to_string(&snapshot) {
                Ok(json) => logger.info("main", &format!("status dump: {json}")),
                Err(e) => logger.warn("main", &format!("status dump failed: {e}")),
            }
        }
    });

    Ok(())
}
