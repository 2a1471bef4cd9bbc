//! State machine tests: guarded transitions, forcing, timers, history.

use crate::common::t0;
use chrono::Duration;
use kamal_napper::core::app_state::{AppState, MAX_HISTORY};
use kamal_napper::core::types::LifecycleState::*;

#[test]
fn new_apps_start_stopped() {
    let app = AppState::new("app.example.com", t0());
    assert_eq!(app.current_state(), Stopped);
    assert_eq!(app.state_changed_at(), t0());
    assert!(app.startup_started_at().is_none());
    assert!(app.history().is_empty());
}

#[test]
fn full_lifecycle_follows_guarded_path() {
    let mut app = AppState::new("app.example.com", t0());
    let mut now = t0();

    for (step, state) in [Starting, Running, Idle, Stopping, Stopped].iter().enumerate() {
        now += Duration::seconds(step as i64 + 1);
        app.transition_to(*state, now).expect("guarded transition");
        assert_eq!(app.current_state(), *state);
        assert_eq!(app.state_changed_at(), now);
    }

    let path: Vec<_> = app.history().iter().map(|r| (r.from, r.to)).collect();
    assert_eq!(
        path,
        vec![
            (Stopped, Starting),
            (Starting, Running),
            (Running, Idle),
            (Idle, Stopping),
            (Stopping, Stopped),
        ]
    );
    assert!(app.history().iter().all(|r| !r.forced));
}

#[test]
fn idle_returns_to_running_on_traffic() {
    let mut app = AppState::new("app.example.com", t0());
    app.force_transition_to(Idle, "seed", t0());
    app.transition_to(Running, t0() + Duration::seconds(1))
        .expect("idle apps resume without restart");
    assert_eq!(app.current_state(), Running);
}

#[test]
fn same_state_transition_is_a_noop() {
    let mut app = AppState::new("app.example.com", t0());
    app.transition_to(Stopped, t0() + Duration::seconds(5))
        .expect("noop");
    assert_eq!(app.state_changed_at(), t0());
    assert!(app.history().is_empty());
}

#[test]
fn invalid_transitions_are_rejected() {
    let mut app = AppState::new("app.example.com", t0());
    let err = app.transition_to(Running, t0()).unwrap_err();
    assert!(err.to_string().contains("stopped -> running"));
    assert_eq!(app.current_state(), Stopped);
    assert!(app.history().is_empty());

    app.transition_to(Starting, t0()).expect("valid");
    assert!(app.transition_to(Idle, t0()).is_err());
    assert!(app.transition_to(Stopping, t0()).is_err());
}

#[test]
fn forced_transitions_bypass_the_guard_and_are_marked() {
    let mut app = AppState::new("app.example.com", t0());
    app.force_transition_to(Running, "state_sync_correction", t0());

    assert_eq!(app.current_state(), Running);
    let record = app.history().back().expect("recorded");
    assert!(record.forced);
    assert_eq!(record.reason.as_deref(), Some("state_sync_correction"));
}

#[test]
fn reset_forces_back_to_stopped() {
    let mut app = AppState::new("app.example.com", t0());
    app.transition_to(Starting, t0()).expect("valid");
    app.reset(t0() + Duration::seconds(1));

    assert_eq!(app.current_state(), Stopped);
    let record = app.history().back().expect("recorded");
    assert!(record.forced);
    assert_eq!(record.reason.as_deref(), Some("reset"));
}

#[test]
fn startup_started_at_tracks_the_starting_state() {
    let mut app = AppState::new("app.example.com", t0());
    assert!(app.startup_started_at().is_none());

    app.transition_to(Starting, t0()).expect("valid");
    assert_eq!(app.startup_started_at(), Some(t0()));

    app.transition_to(Running, t0() + Duration::seconds(3))
        .expect("valid");
    assert!(app.startup_started_at().is_none());

    // Forced entry into Starting also sets it
    app.force_transition_to(Starting, "test", t0() + Duration::seconds(4));
    assert_eq!(
        app.startup_started_at(),
        Some(t0() + Duration::seconds(4))
    );
}

#[test]
fn state_changed_at_never_moves_backwards() {
    let mut app = AppState::new("app.example.com", t0());
    app.transition_to(Starting, t0() + Duration::seconds(10))
        .expect("valid");

    // Wall clock steps back; the recorded timestamp must not
    app.transition_to(Running, t0() + Duration::seconds(5))
        .expect("valid");
    assert_eq!(app.state_changed_at(), t0() + Duration::seconds(10));
}

#[test]
fn history_is_bounded_and_drops_oldest() {
    let mut app = AppState::new("app.example.com", t0());
    for i in 0..(MAX_HISTORY + 20) {
        app.force_transition_to(
            if i % 2 == 0 { Running } else { Stopped },
            "churn",
            t0() + Duration::seconds(i as i64),
        );
    }

    assert_eq!(app.history().len(), MAX_HISTORY);
    // Oldest surviving record is number 20, not number 0
    assert_eq!(
        app.history().front().expect("nonempty").timestamp,
        t0() + Duration::seconds(20)
    );
}

#[test]
fn predicates_partition_the_states() {
    let mut app = AppState::new("app.example.com", t0());

    // (state, active, inactive, stable)
    let expectations = [
        (Stopped, false, true, true),
        (Starting, false, false, false),
        (Running, true, false, true),
        (Idle, true, false, true),
        (Stopping, false, true, false),
    ];
    for (state, active, inactive, stable) in expectations {
        app.force_transition_to(state, "test", t0());
        assert_eq!(app.active(), active, "{state} active");
        assert_eq!(app.inactive(), inactive, "{state} inactive");
        assert_eq!(app.stable(), stable, "{state} stable");
        assert_eq!(app.transitioning(), !stable, "{state} transitioning");
    }
}

#[test]
fn restore_reinstates_timestamps_and_marks_history() {
    let changed = t0() - Duration::seconds(500);
    let app = AppState::restore(
        "app.example.com",
        Running,
        changed,
        None,
        Vec::new(),
        t0(),
    );

    assert_eq!(app.current_state(), Running);
    assert_eq!(app.state_changed_at(), changed);
    assert!(app.startup_started_at().is_none());
    let marker = app.history().back().expect("marker");
    assert!(marker.forced);
    assert_eq!(marker.reason.as_deref(), Some("restored_from_disk"));
}

#[test]
fn restore_repairs_the_startup_timestamp_invariant() {
    let changed = t0() - Duration::seconds(30);

    // Starting without a persisted startup timestamp falls back to the
    // state-change time
    let starting = AppState::restore("a.example.com", Starting, changed, None, Vec::new(), t0());
    assert_eq!(starting.startup_started_at(), Some(changed));

    // A stale startup timestamp on a non-Starting state is dropped
    let running = AppState::restore(
        "b.example.com",
        Running,
        changed,
        Some(changed),
        Vec::new(),
        t0(),
    );
    assert!(running.startup_started_at().is_none());
}

#[test]
fn seconds_in_state_uses_the_supplied_clock() {
    let app = AppState::new("app.example.com", t0());
    assert_eq!(app.seconds_in_state(t0() + Duration::seconds(42)), 42);
}
