//! Runner tests: container selection by label, retry exhaustion, maintenance
//! toggling, and discovery.

use crate::common::{create_temp_dir, test_config, test_logger};
use kamal_napper::config::Config;
use kamal_napper::core::runner::{CommandOutput, MockCommandExecutor, Runner};
use std::sync::Arc;

fn runner_with(config: &Config) -> (Arc<MockCommandExecutor>, Runner) {
    let executor = Arc::new(MockCommandExecutor::new());
    let runner = Runner::new(executor.clone(), test_logger(), config);
    (executor, runner)
}

fn runner() -> (Arc<MockCommandExecutor>, Runner) {
    let temp = create_temp_dir();
    let config = test_config(temp.path());
    runner_with(&config)
}

#[tokio::test]
async fn start_picks_the_first_stopped_container() {
    let (executor, runner) = runner();
    executor.stub(
        "label=service=app",
        CommandOutput::ok("app-web-1\trunning\napp-web-2\texited\n"),
    );

    let started = runner.start_app_container("app.example.com").await.unwrap();
    assert!(started);
    assert_eq!(executor.calls_matching("start app-web-2"), 1);
    assert_eq!(executor.calls_matching("start app-web-1"), 0);
}

#[tokio::test]
async fn start_without_candidates_reports_false_without_error() {
    let (executor, runner) = runner();
    executor.stub(
        "label=service=app",
        CommandOutput::ok("app-web-1\trunning\n"),
    );

    let started = runner.start_app_container("app.example.com").await.unwrap();
    assert!(!started);
    assert_eq!(executor.calls_matching("docker start"), 0);
}

#[tokio::test]
async fn stop_halts_the_first_running_container() {
    let (executor, runner) = runner();
    executor.stub(
        "label=service=app",
        CommandOutput::ok("app-web-1\texited\napp-web-2\trunning\n"),
    );

    let stopped = runner.stop_app_container("app.example.com").await.unwrap();
    assert!(stopped);
    assert_eq!(executor.calls_matching("stop app-web-2"), 1);
}

#[tokio::test]
async fn retries_are_bounded_and_surface_command_errors() {
    let (executor, runner) = runner();
    executor.stub("label=service=app", CommandOutput::failed(1, "daemon down"));

    let err = runner
        .stop_app_container("app.example.com")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("after 1 attempts"));
    assert!(err.to_string().contains("daemon down"));
    // max_retries = 0 in the test config: exactly one attempt
    assert_eq!(executor.calls_matching("label=service=app"), 1);
}

#[tokio::test]
async fn force_stop_kills_and_tolerates_failure() {
    let (executor, runner) = runner();
    executor.stub(
        "label=service=app",
        CommandOutput::ok("app-web-1\trunning\n"),
    );
    executor.stub("kill", CommandOutput::failed(1, "no such container"));

    // Must not panic or error out
    runner.force_stop_app_container("app.example.com").await;
    assert_eq!(executor.calls_matching("kill app-web-1"), 1);
}

#[tokio::test]
async fn maintenance_toggles_through_the_proxy_container() {
    let (executor, runner) = runner();

    runner.set_maintenance("app.example.com", true).await;
    runner.set_maintenance("app.example.com", false).await;

    assert_eq!(
        executor.calls_matching("exec kamal-proxy kamal-proxy pause app"),
        1
    );
    assert_eq!(
        executor.calls_matching("exec kamal-proxy kamal-proxy resume app"),
        1
    );
}

#[tokio::test]
async fn maintenance_failures_never_escape() {
    let (executor, runner) = runner();
    executor.stub("exec kamal-proxy", CommandOutput::failed(1, "proxy gone"));

    // Logged, swallowed
    runner.set_maintenance("app.example.com", true).await;
    assert_eq!(executor.calls_matching("pause app"), 1);
}

#[tokio::test]
async fn discovery_reads_labels_and_skips_the_proxy() {
    let (executor, runner) = runner();
    executor.stub(
        "--filter label=service",
        CommandOutput::ok(
            "app-web-1\tservice=app,role=web,rule=Host(`app.example.com`)\n\
             other-web-1\tservice=other.example.com,role=web\n\
             kamal-proxy\tservice=proxy,role=proxy\n",
        ),
    );

    let apps = runner.discover_kamal_apps().await;

    let app = apps.get("app.example.com").expect("labeled host");
    assert_eq!(app.service, "app");
    assert_eq!(app.container_name.as_deref(), Some("app-web-1"));

    // No routing label: hostname synthesized from the service name
    assert!(apps.contains_key("other.example.com"));
    // The proxy itself is never a managed app
    assert!(!apps.values().any(|a| a.service == "proxy"));
}

#[tokio::test]
async fn discovery_also_mines_the_proxy_log_for_routes() {
    let (executor, runner) = runner();
    executor.stub(
        "logs --tail",
        CommandOutput::ok(
            r#"{"time":"2026-08-01T10:00:00Z","msg":"Deployed","rule":"Host(`logged.example.com`)"}"#,
        ),
    );

    let apps = runner.discover_kamal_apps().await;
    let app = apps.get("logged.example.com").expect("log-derived host");
    assert_eq!(app.service, "logged");
    assert!(app.container_name.is_none());
}

#[tokio::test]
async fn proxy_log_tail_falls_back_to_stderr() {
    let (executor, runner) = runner();
    executor.stub(
        "logs --tail",
        CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: "log line on stderr".to_string(),
        },
    );

    let tail = runner.proxy_log_tail(100).await.expect("tail");
    assert_eq!(tail, "log line on stderr");
}
