use std::time::Duration;

use quarry::client::CircuitBreaker;

const COOLDOWN: Duration = Duration::from_secs(5);

fn breaker() -> CircuitBreaker {
    CircuitBreaker::new(3, COOLDOWN)
}

#[tokio::test(start_paused = true)]
async fn stays_closed_below_threshold() {
    let b = breaker();
    b.record_failure();
    b.record_failure();
    assert!(b.preflight().is_ok(), "two failures should not open");
}

#[tokio::test(start_paused = true)]
async fn opens_after_three_consecutive_failures() {
    let b = breaker();
    for _ in 0..3 {
        assert!(b.preflight().is_ok());
        b.record_failure();
    }
    assert!(b.preflight().is_err(), "circuit should fail fast while open");
}

#[tokio::test(start_paused = true)]
async fn success_resets_consecutive_failure_count() {
    let b = breaker();
    b.record_failure();
    b.record_failure();
    b.record_success();
    b.record_failure();
    b.record_failure();
    assert!(
        b.preflight().is_ok(),
        "failures are only counted consecutively"
    );
}

#[tokio::test(start_paused = true)]
async fn permits_single_probe_after_cooldown() {
    let b = breaker();
    for _ in 0..3 {
        b.record_failure();
    }
    assert!(b.preflight().is_err());

    tokio::time::advance(COOLDOWN).await;

    // Exactly one probe goes through; a second caller still fails fast.
    assert!(b.preflight().is_ok(), "probe should be permitted");
    assert!(b.preflight().is_err(), "only one probe at a time");
}

#[tokio::test(start_paused = true)]
async fn probe_success_closes_the_circuit() {
    let b = breaker();
    for _ in 0..3 {
        b.record_failure();
    }
    tokio::time::advance(COOLDOWN).await;

    assert!(b.preflight().is_ok());
    b.record_success();

    assert!(b.preflight().is_ok(), "circuit should be closed again");
    // And the failure streak restarts from zero.
    b.record_failure();
    assert!(b.preflight().is_ok());
}

#[tokio::test(start_paused = true)]
async fn probe_failure_reopens_the_circuit() {
    let b = breaker();
    for _ in 0..3 {
        b.record_failure();
    }
    tokio::time::advance(COOLDOWN).await;

    assert!(b.preflight().is_ok());
    b.record_failure();

    assert!(b.preflight().is_err(), "failed probe reopens immediately");

    // A full cool-down later another probe is allowed.
    tokio::time::advance(COOLDOWN).await;
    assert!(b.preflight().is_ok());
}

#[tokio::test(start_paused = true)]
async fn stays_open_before_cooldown_elapses() {
    let b = breaker();
    for _ in 0..3 {
        b.record_failure();
    }
    tokio::time::advance(COOLDOWN - Duration::from_millis(1)).await;
    assert!(b.preflight().is_err(), "cool-down has not elapsed yet");
}
