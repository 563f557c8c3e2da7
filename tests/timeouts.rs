//! The two clocks: total wall time and output idleness.

#![cfg(unix)]

use std::time::{Duration, Instant};

use anyhow::Result;
use procmux::{Config, Error, Supervisor};

#[tokio::test]
async fn the_total_clock_kills_and_reports() -> Result<()> {
    let mut sup = Supervisor::new(
        Config::shell("sleep 5").timeout(Duration::from_millis(200)),
    );
    sup.start().await?;
    let started = Instant::now();
    let err = sup.wait().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(sup.is_terminated());
    Ok(())
}

#[tokio::test]
async fn the_idle_clock_fires_without_output() -> Result<()> {
    let mut sup = Supervisor::new(
        Config::shell("printf early; sleep 5").idle_timeout(Duration::from_millis(300)),
    );
    sup.start().await?;
    let err = sup.wait().await.unwrap_err();
    assert!(matches!(err, Error::IdleTimeout { .. }), "got {err:?}");
    assert_eq!(sup.output_string()?, "early");
    Ok(())
}

#[tokio::test]
async fn steady_output_keeps_the_idle_clock_quiet() -> Result<()> {
    let mut sup = Supervisor::new(
        Config::shell("for i in 1 2 3 4; do printf $i; sleep 0.1; done")
            .idle_timeout(Duration::from_millis(500)),
    );
    sup.start().await?;
    let code = sup.wait().await?;
    assert_eq!(code, 0);
    assert_eq!(sup.output_string()?, "1234");
    Ok(())
}

#[tokio::test]
async fn the_earlier_deadline_wins_when_both_expire() -> Result<()> {
    // A child that stays silent: the idle deadline passes first.
    let mut sup = Supervisor::new(
        Config::shell("sleep 5")
            .timeout(Duration::from_millis(400))
            .idle_timeout(Duration::from_millis(150)),
    );
    sup.start().await?;
    let err = sup.wait().await.unwrap_err();
    assert!(matches!(err, Error::IdleTimeout { .. }), "got {err:?}");

    // And the mirror image: the total deadline is the earlier one.
    let mut sup = Supervisor::new(
        Config::shell("sleep 5")
            .timeout(Duration::from_millis(150))
            .idle_timeout(Duration::from_millis(400)),
    );
    sup.start().await?;
    let err = sup.wait().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn zero_limits_leave_the_clocks_off() -> Result<()> {
    let mut sup = Supervisor::new(
        Config::shell("sleep 0.3; printf done")
            .timeout(Duration::ZERO)
            .idle_timeout(Duration::ZERO),
    );
    sup.start().await?;
    let code = sup.wait().await?;
    assert_eq!(code, 0);
    assert_eq!(sup.output_string()?, "done");
    Ok(())
}
