//! The descriptor-3 exit channel for runtimes that mask child status.

#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use pretty_assertions::assert_eq;
use procmux::{Config, IterFlags, SIGTERM, Supervisor};

#[tokio::test]
async fn the_sideband_publishes_pid_and_exit_code() -> Result<()> {
    let mut sup = Supervisor::new(
        Config::shell("printf out; exit 7").force_exit_sideband(true),
    );
    sup.start().await?;
    let code = sup.wait().await?;
    assert_eq!(code, 7);
    assert_eq!(sup.output_string()?, "out");
    assert!(!sup.is_signaled()?);
    Ok(())
}

#[tokio::test]
async fn killing_a_wrapped_child_keeps_the_cause_observable() -> Result<()> {
    let mut sup = Supervisor::new(Config::shell("sleep 5").force_exit_sideband(true));
    sup.start().await?;
    let code = sup.kill(Duration::from_secs(5), None).await?;
    assert_eq!(code, 128 + SIGTERM);
    assert!(sup.is_signaled()?);
    assert_eq!(sup.term_signal()?, SIGTERM);
    Ok(())
}

#[tokio::test]
async fn a_user_signal_surfaces_through_the_fallback_record() -> Result<()> {
    let script = "trap 'printf get; exit 0' USR1; \
                  i=0; while [ $i -lt 4 ]; do printf %s $i; i=$((i+1)); sleep 0.1; done; sleep 5";
    let mut sup = Supervisor::new(Config::shell(script).force_exit_sideband(true));
    sup.start().await?;

    {
        let mut iter = sup.iter_output(IterFlags::default());
        let mut seen = String::new();
        let mut signaled = false;
        while let Some((_, chunk)) = iter.next().await? {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if !signaled && seen.contains('2') {
                iter.supervisor().signal(libc::SIGUSR1).await?;
                signaled = true;
            }
        }
    }

    // The wrapping shell layer absorbs the signal, so the handler
    // inside the child never sees it; the fallback record is what
    // keeps the self-sent signal observable at all.
    assert!(sup.is_signaled()?);
    assert_eq!(sup.term_signal()?, libc::SIGUSR1);
    assert!(sup.output_string()?.starts_with("012"));
    Ok(())
}

#[tokio::test]
async fn input_still_flows_through_the_wrapping_shell() -> Result<()> {
    let mut sup = Supervisor::new(
        Config::shell("cat")
            .force_exit_sideband(true)
            .input("through-the-wrapper")?,
    );
    sup.start().await?;
    let code = sup.wait().await?;
    assert_eq!(code, 0);
    assert_eq!(sup.output_string()?, "through-the-wrapper");
    Ok(())
}
