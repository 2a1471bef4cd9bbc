//! RequestDetector tests: proxy-log scanning, the automated-request filter,
//! timestamp files, and the access-log fallback.

use crate::common::{t0, Harness};
use chrono::Duration as ChronoDuration;
use kamal_napper::core::runner::CommandOutput;
use std::time::Duration;

#[tokio::test]
async fn user_traffic_in_proxy_log_counts_as_recent() {
    let harness = Harness::new();
    let lines = [
        harness.request_line("app.example.com", "/health", "GET", "curl/8 health", t0()),
        harness.request_line("app.example.com", "/", "GET", "Mozilla/5.0", t0()),
    ]
    .join("\n");
    harness.stub_proxy_log(&lines);

    assert!(
        harness
            .detector
            .recent_requests("app.example.com", Duration::from_secs(30))
            .await
    );
}

#[tokio::test]
async fn automated_only_traffic_is_not_recent() {
    let harness = Harness::new();
    let line = harness.request_line("app.example.com", "/health", "GET", "curl/8 health", t0());
    harness.stub_proxy_log(&line);

    assert!(
        !harness
            .detector
            .recent_requests("app.example.com", Duration::from_secs(30))
            .await
    );
    assert!(harness
        .detector
        .last_request_time("app.example.com")
        .await
        .is_none());
}

#[tokio::test]
async fn bot_agents_head_requests_and_acme_paths_are_filtered() {
    let harness = Harness::new();
    let lines = [
        harness.request_line("app.example.com", "/", "GET", "Googlebot/2.1", t0()),
        harness.request_line("app.example.com", "/", "HEAD", "Mozilla/5.0", t0()),
        harness.request_line("app.example.com", "/", "GET", "", t0()),
        harness.request_line(
            "app.example.com",
            "/.well-known/acme-challenge/tok",
            "GET",
            "Mozilla/5.0",
            t0(),
        ),
        harness.request_line("app.example.com", "/status", "GET", "Mozilla/5.0", t0()),
    ]
    .join("\n");
    harness.stub_proxy_log(&lines);

    assert!(
        !harness
            .detector
            .recent_requests("app.example.com", Duration::from_secs(30))
            .await
    );
}

#[tokio::test]
async fn entries_past_the_one_hour_horizon_are_ignored() {
    let harness = Harness::new();
    let old = t0() - ChronoDuration::seconds(2 * 3600);
    let line = harness.request_line("app.example.com", "/", "GET", "Mozilla/5.0", old);
    harness.stub_proxy_log(&line);

    assert!(harness
        .detector
        .last_request_time("app.example.com")
        .await
        .is_none());
}

#[tokio::test]
async fn malformed_log_lines_are_skipped() {
    let harness = Harness::new();
    let lines = format!(
        "not json at all\n{{\"msg\":\"Request\"}}\n{}",
        harness.request_line("app.example.com", "/", "GET", "Mozilla/5.0", t0())
    );
    harness.stub_proxy_log(&lines);

    assert_eq!(
        harness.detector.last_request_time("app.example.com").await,
        Some(t0())
    );
}

#[tokio::test]
async fn timestamp_files_union_with_log_results() {
    let harness = Harness::new();
    let log_time = t0() - ChronoDuration::seconds(120);
    let file_time = t0() - ChronoDuration::seconds(10);
    let line = harness.request_line("app.example.com", "/", "GET", "Mozilla/5.0", log_time);
    harness.stub_proxy_log(&line);
    harness.write_timestamp_file("app.example.com", file_time);

    // The newer of the two sources wins
    assert_eq!(
        harness.detector.last_request_time("app.example.com").await,
        Some(file_time)
    );
}

#[tokio::test]
async fn update_last_request_time_writes_through() {
    let harness = Harness::new();
    harness
        .detector
        .update_last_request_time("app.example.com", t0())
        .await;

    assert_eq!(
        harness.detector.last_request_time("app.example.com").await,
        Some(t0())
    );
    let hosts = harness.detector.detected_hostnames().await;
    assert!(hosts.contains(&"app.example.com".to_string()));

    // Stale explicit updates never move the needle backwards
    harness
        .detector
        .update_last_request_time("app.example.com", t0() - ChronoDuration::seconds(60))
        .await;
    assert_eq!(
        harness.detector.last_request_time("app.example.com").await,
        Some(t0())
    );
}

#[tokio::test]
async fn detected_hostnames_merge_logs_and_timestamp_files() {
    let harness = Harness::new();
    let line = harness.request_line("one.example.com", "/", "GET", "Mozilla/5.0", t0());
    harness.stub_proxy_log(&line);
    harness.write_timestamp_file("two.example.com", t0());

    let hosts = harness.detector.detected_hostnames().await;
    assert!(hosts.contains(&"one.example.com".to_string()));
    assert!(hosts.contains(&"two.example.com".to_string()));
}

#[tokio::test]
async fn self_hosts_never_appear_in_detection() {
    let harness = Harness::with_config(|c| {
        c.own_hostname = Some("napper.example.com".to_string());
    });
    let lines = [
        harness.request_line("napper.example.com", "/", "GET", "Mozilla/5.0", t0()),
        harness.request_line("kamal-napper.example.com", "/", "GET", "Mozilla/5.0", t0()),
        harness.request_line("naptime.example.com", "/", "GET", "Mozilla/5.0", t0()),
        harness.request_line("app.example.com", "/", "GET", "Mozilla/5.0", t0()),
    ]
    .join("\n");
    harness.stub_proxy_log(&lines);

    let hosts = harness.detector.detected_hostnames().await;
    assert_eq!(hosts, vec!["app.example.com".to_string()]);
}

#[tokio::test]
async fn access_log_fallback_covers_a_missing_proxy() {
    let logs = crate::common::create_temp_dir();
    let stamp = t0().format("%d/%b/%Y:%H:%M:%S %z");
    std::fs::write(
        logs.path().join("access.log"),
        format!(
            "203.0.113.9 - - [{stamp}] \"GET / HTTP/1.1\" 200 512 \"-\" \"Mozilla/5.0\" \"app.example.com\"\n"
        ),
    )
    .expect("write access log");

    let log_dir = logs.path().to_path_buf();
    let harness = Harness::with_config(move |c| {
        c.access_log_dir = Some(log_dir);
    });
    harness
        .executor
        .stub("logs --tail", CommandOutput::failed(1, "no such container"));

    assert!(
        harness
            .detector
            .recent_requests("app.example.com", Duration::from_secs(60))
            .await
    );
}
