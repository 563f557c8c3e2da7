//! End-to-end supervision over real children.

#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use pretty_assertions::assert_eq;
use procmux::{Config, Error, InputSource, Mode, State, Supervisor};

#[tokio::test]
async fn echoes_a_string_input_back() -> Result<()> {
    let mut sup = Supervisor::new(Config::shell("cat").input("string")?);
    sup.start().await?;
    let code = sup.wait().await?;
    assert_eq!(code, 0);
    assert!(sup.is_successful());
    assert_eq!(sup.output()?, b"string");
    Ok(())
}

#[tokio::test]
async fn concatenates_mixed_chunks() -> Result<()> {
    let source = InputSource::new();
    source.write("foo_")?;
    source.write("bar_")?;
    source.write("biz")?;
    source.close();

    let mut sup = Supervisor::new(Config::shell("cat").input_source(source));
    sup.start().await?;
    sup.wait().await?;
    assert_eq!(sup.output_string()?, "foo_bar_biz");
    Ok(())
}

#[tokio::test]
async fn propagates_the_exit_code() -> Result<()> {
    let mut sup = Supervisor::shell("printf code; exit 130");
    sup.start().await?;
    let code = sup.wait().await?;
    assert_eq!(code, 130);
    assert_eq!(sup.output_string()?, "code");
    assert!(!sup.is_successful());
    assert!(!sup.is_signaled()?);
    Ok(())
}

#[tokio::test]
async fn large_inputs_survive_short_writes() -> Result<()> {
    let big = "x".repeat(300_000);
    let mut sup = Supervisor::new(Config::shell("cat").input(big.clone())?);
    sup.start().await?;
    let code = sup.wait().await?;
    assert_eq!(code, 0);
    let out = sup.output()?;
    assert_eq!(out.len(), big.len());
    assert_eq!(out, big.as_bytes());
    Ok(())
}

#[tokio::test]
async fn stderr_is_captured_separately() -> Result<()> {
    let mut sup = Supervisor::shell("printf out; printf err >&2");
    sup.start().await?;
    sup.wait().await?;
    assert_eq!(sup.output_string()?, "out");
    assert_eq!(sup.error_output_string()?, "err");
    Ok(())
}

#[tokio::test]
async fn state_progression_is_strict_and_terminal_is_absorbing() -> Result<()> {
    let mut sup = Supervisor::shell("printf hi");
    assert_eq!(sup.state(), State::Ready);

    // Waiting before starting is a usage error.
    assert!(matches!(sup.wait().await, Err(Error::Logic(_))));

    sup.start().await?;
    assert!(sup.is_started());
    sup.wait().await?;
    assert_eq!(sup.state(), State::Terminated);

    // Status refreshes cannot leave the terminal state.
    sup.update_status(true).await?;
    assert_eq!(sup.state(), State::Terminated);

    // Re-running takes a fresh clone, which starts over in Ready.
    let clone = sup.clone_ready();
    assert_eq!(clone.state(), State::Ready);
    assert_eq!(clone.pid(), None);
    Ok(())
}

#[tokio::test]
async fn starting_twice_is_rejected() -> Result<()> {
    let mut sup = Supervisor::shell("sleep 2");
    sup.start().await?;
    assert!(matches!(
        sup.start().await,
        Err(Error::Runtime { .. })
    ));
    sup.kill(Duration::from_secs(5), None).await?;
    Ok(())
}

#[tokio::test]
async fn output_access_is_idempotent_and_clearable() -> Result<()> {
    let mut sup = Supervisor::shell("printf stable");
    sup.start().await?;
    sup.wait().await?;
    let first = sup.output()?;
    let second = sup.output()?;
    assert_eq!(first, second);
    sup.clear_output()?;
    assert_eq!(sup.output()?, b"");
    Ok(())
}

#[tokio::test]
async fn env_overrides_and_removals_reach_the_child() -> Result<()> {
    // The removal has to hide a variable the parent actually has.
    unsafe { std::env::set_var("PROCMUX_DOOMED", "present") };
    let mut sup = Supervisor::new(
        Config::shell("printf %s%s \"$PROCMUX_GIVEN\" \"${PROCMUX_DOOMED:-gone}\"")
            .env("PROCMUX_GIVEN", "set-")
            .env_remove("PROCMUX_DOOMED"),
    );
    sup.start().await?;
    sup.wait().await?;
    assert_eq!(sup.output_string()?, "set-gone");
    Ok(())
}

#[tokio::test]
async fn runs_in_the_configured_working_directory() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let expected = std::fs::canonicalize(dir.path())?;
    let mut sup = Supervisor::new(Config::shell("pwd").cwd(dir.path()));
    sup.start().await?;
    sup.wait().await?;
    let out = sup.output_string()?;
    assert_eq!(out.trim_end(), expected.display().to_string());
    Ok(())
}

#[tokio::test]
async fn argv_form_escapes_each_element() -> Result<()> {
    let mut sup = Supervisor::argv(["printf", "%s", "a b'c"]);
    sup.start().await?;
    sup.wait().await?;
    assert_eq!(sup.output_string()?, "a b'c");
    Ok(())
}

#[tokio::test]
async fn disabled_output_rejects_observation_but_runs() -> Result<()> {
    let mut sup = Supervisor::new(
        Config::shell("cat >/dev/null")
            .mode(Mode::OutputDisabled)
            .input("swallowed")?,
    );
    sup.start().await?;

    // A callback has nothing to observe.
    assert!(matches!(
        sup.wait_with(|_, _| {}).await,
        Err(Error::Runtime { .. })
    ));

    let code = sup.wait().await?;
    assert_eq!(code, 0);
    assert!(matches!(sup.output(), Err(Error::Logic(_))));
    assert!(matches!(sup.clear_output(), Err(Error::Logic(_))));
    Ok(())
}

#[tokio::test]
async fn spawn_failure_is_a_runtime_error() {
    let mut sup = Supervisor::new(Config::shell("true").cwd("/definitely/not/a/directory"));
    let err = sup.start().await.unwrap_err();
    assert!(matches!(err, Error::Runtime { .. }));
    assert_eq!(sup.state(), State::Ready);
}

#[tokio::test]
async fn config_is_frozen_while_running() -> Result<()> {
    let mut sup = Supervisor::shell("sleep 2");
    sup.config_mut()?; // fine before start
    sup.start().await?;
    assert!(matches!(sup.config_mut(), Err(Error::Runtime { .. })));
    sup.kill(Duration::from_secs(5), None).await?;
    Ok(())
}
