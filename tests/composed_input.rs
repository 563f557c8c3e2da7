//! Composed, lazily-expanded input flows.

#![cfg(unix)]

use std::io::Write;

use anyhow::Result;
use pretty_assertions::assert_eq;
use procmux::{Channel, Chunk, Config, InputSource, Supervisor};

#[tokio::test]
async fn nested_containers_flatten_depth_first() -> Result<()> {
    let nested = InputSource::new();
    nested.write("_b")?;
    nested.write("_c")?;
    nested.close();

    let source = InputSource::new();
    source.write("_a")?;
    source.write_source(nested)?;
    source.write("_d")?;
    source.close();

    let mut sup = Supervisor::new(Config::shell("cat").input_source(source));
    sup.start().await?;
    sup.wait().await?;
    assert_eq!(sup.output_string()?, "_a_b_c_d");
    Ok(())
}

#[tokio::test]
async fn streams_processes_and_late_appends_compose() -> Result<()> {
    // A file-backed stream chunk.
    let mut stream_file = tempfile::NamedTempFile::new()?;
    stream_file.write_all(b"_stream")?;
    stream_file.flush()?;
    let reader = tokio::fs::File::from_std(stream_file.reopen()?);

    let nested = InputSource::new();
    nested.write("_string3")?;
    nested.write_process(Supervisor::shell("printf _process"))?;
    nested.write_iter(vec![
        Chunk::Bytes(b"_arr".to_vec()),
        Chunk::Bytes(b"_arr2".to_vec()),
        Chunk::Reader(Box::new(reader)),
    ])?;
    nested.close();

    let tail = InputSource::new();
    tail.write("_iter1")?;

    let source = InputSource::new();
    source.write("_string1")?;
    source.write("_string2")?;
    source.write_source(nested)?;
    source.write_source(tail.clone())?;
    source.close();

    let mut sup = Supervisor::new(Config::shell("cat").input_source(source));
    sup.start().await?;

    // The tail stays open until its first chunk comes back around.
    let mut appended = false;
    let appender = tail.clone();
    let mut seen = String::new();
    sup.wait_with(move |channel, chunk| {
        if channel == Channel::Out && !appended {
            seen.push_str(&String::from_utf8_lossy(chunk));
            if seen.contains("_iter1") {
                appender.write("_iter2").expect("append to the open tail");
                appender.close();
                appended = true;
            }
        }
    })
    .await?;

    assert_eq!(
        sup.output_string()?,
        "_string1_string2_string3_process_arr_arr2_stream_iter1_iter2"
    );
    Ok(())
}

#[tokio::test]
async fn a_supervisor_is_a_valid_input_chunk() -> Result<()> {
    // The inner child's stderr must not leak into the outer stdin.
    let inner = Supervisor::shell("printf inner-out; printf inner-err >&2");

    let source = InputSource::new();
    source.write("[")?;
    source.write(inner)?;
    source.write("]")?;
    source.close();

    let mut sup = Supervisor::new(Config::shell("cat").input_source(source));
    sup.start().await?;
    sup.wait().await?;
    assert_eq!(sup.output_string()?, "[inner-out]");
    Ok(())
}

#[tokio::test]
async fn scalar_values_arrive_in_decimal_form() -> Result<()> {
    let source = InputSource::new();
    source.write(1u32)?;
    source.write("|")?;
    source.write(-2i64)?;
    source.write("|")?;
    source.write(2.5f64)?;
    source.write(Option::<&str>::None)?;
    source.close();

    let mut sup = Supervisor::new(Config::shell("cat").input_source(source));
    sup.start().await?;
    sup.wait().await?;
    assert_eq!(sup.output_string()?, "1|-2|2.5");
    Ok(())
}
