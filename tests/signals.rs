//! Kill escalation and signal dispatch.

#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use pretty_assertions::assert_eq;
use procmux::{IterFlags, SIGTERM, Supervisor};

const COUNTING_CHILD: &str = "i=0; while true; do echo $i; i=$((i+1)); sleep 0.1; done";

#[tokio::test]
async fn kill_during_an_output_loop_reports_the_signal() -> Result<()> {
    let mut sup = Supervisor::shell(COUNTING_CHILD);
    sup.start().await?;

    let mut seen = String::new();
    {
        let mut iter = sup.iter_output(IterFlags::default());
        while let Some((_, chunk)) = iter.next().await? {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains('2') {
                break;
            }
        }
    }

    let code = sup.kill(Duration::from_secs(5), None).await?;
    assert_eq!(code, 128 + SIGTERM);
    assert!(sup.is_signaled()?);
    assert_eq!(sup.term_signal()?, SIGTERM);
    assert!(!sup.is_successful());
    Ok(())
}

#[tokio::test]
async fn a_handled_user_signal_is_not_a_signal_death() -> Result<()> {
    let script = "trap 'printf get; exit 0' USR1; \
                  i=0; while [ $i -lt 4 ]; do printf %s $i; i=$((i+1)); sleep 0.1; done; sleep 5";
    let mut sup = Supervisor::shell(script);
    sup.start().await?;

    let mut signaled = false;
    {
        let mut iter = sup.iter_output(IterFlags::default());
        let mut seen = String::new();
        while let Some((_, chunk)) = iter.next().await? {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if !signaled && seen.contains('2') {
                iter.supervisor().signal(libc::SIGUSR1).await?;
                signaled = true;
            }
        }
    }

    assert_eq!(sup.exit_code(), Some(0));
    assert!(!sup.is_signaled()?);
    let out = sup.output_string()?;
    assert!(out.starts_with("012"), "unexpected output: {out:?}");
    assert!(out.ends_with("get"), "unexpected output: {out:?}");
    Ok(())
}

#[tokio::test]
async fn wait_flags_a_signal_nobody_here_sent() -> Result<()> {
    let mut sup = Supervisor::shell("kill -9 $$");
    sup.start().await?;
    let err = sup.wait().await.unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("signaled with signal 9"),
        "unexpected error: {message}"
    );
    assert!(sup.is_signaled()?);
    assert_eq!(sup.term_signal()?, 9);
    Ok(())
}

#[tokio::test]
async fn signaling_a_finished_child_is_a_usage_error() -> Result<()> {
    let mut sup = Supervisor::shell("true");
    sup.start().await?;
    sup.wait().await?;
    assert!(matches!(
        sup.signal(SIGTERM).await,
        Err(procmux::Error::Logic(_))
    ));
    Ok(())
}

#[tokio::test]
async fn term_signal_on_a_clean_exit_is_a_usage_error() -> Result<()> {
    let mut sup = Supervisor::shell("true");
    sup.start().await?;
    sup.wait().await?;
    assert!(matches!(
        sup.term_signal(),
        Err(procmux::Error::Logic(_))
    ));
    Ok(())
}
