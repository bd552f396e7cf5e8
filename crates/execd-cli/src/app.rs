//! Moves metrics between the console streams and the coprocess.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use bytes::BytesMut;
use execd::ChannelAccumulator;
use execd::DataFormat;
use execd::Emitted;
use execd::Execd;
use execd::ExecdConfig;
use execd::MinMax;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::Interval;
use tracing::info;
use tracing::warn;

use crate::report;

/// Feeds `input` through the coprocess until EOF or `interrupt` resolves,
/// then stops it and returns `output` once every result was written.
pub(crate) async fn run<R, W>(
    config: ExecdConfig,
    minmax_period: Option<Duration>,
    input: R,
    output: W,
    interrupt: impl std::future::Future<Output = ()>,
) -> Result<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let format = config.data_format;
    let execd = Execd::new(config).map_err(report)?;
    let (accumulator, outputs) = ChannelAccumulator::new();
    execd.start(Arc::new(accumulator)).await.map_err(report)?;
    info!(name = execd.name(), "process started, reading metrics from stdin");

    let writer = tokio::spawn(write_outputs(outputs, format, minmax_period, output));

    let read = tokio::select! {
        result = read_inputs(&execd, format, input) => result,
        _ = interrupt => {
            info!("interrupted");
            Ok(())
        }
    };
    execd.stop().await;

    let output = writer.await.context("output task failed")??;
    read?;
    Ok(output)
}

async fn read_inputs<R>(execd: &Execd, format: DataFormat, mut input: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = format.decoder();
    let mut buf = BytesMut::with_capacity(8192);
    loop {
        let read = input
            .read_buf(&mut buf)
            .await
            .context("failed to read stdin")?;
        let eof = read == 0;
        loop {
            let decoded = if eof {
                decoder.decode_eof(&mut buf)
            } else {
                decoder.decode(&mut buf)
            };
            match decoded {
                None => break,
                Some(Ok(metric)) => execd.add(metric).await.map_err(report)?,
                Some(Err(e)) => warn!("skipping malformed input: {e}"),
            }
        }
        if eof {
            return Ok(());
        }
    }
}

async fn write_outputs<W>(
    mut outputs: UnboundedReceiver<Emitted>,
    format: DataFormat,
    minmax_period: Option<Duration>,
    mut output: W,
) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    let encoder = format.encoder();
    let mut minmax = minmax_period.map(|_| MinMax::new());
    let mut ticker = minmax_period.map(|period| interval_at(Instant::now() + period, period));
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            emitted = outputs.recv() => {
                let Some(emitted) = emitted else {
                    break;
                };
                if let Some(minmax) = minmax.as_mut() {
                    minmax.add(emitted.metric());
                }
                buf.clear();
                if let Err(e) = encoder.encode(emitted.metric(), &mut buf) {
                    warn!("dropping output that cannot be encoded: {e}");
                    emitted.reject();
                    continue;
                }
                output.write_all(&buf).await.context("failed to write stdout")?;
                output.flush().await.context("failed to flush stdout")?;
                emitted.accept();
            }
            _ = tick(&mut ticker) => {
                if let Some(minmax) = minmax.as_mut() {
                    write_aggregates(minmax, encoder.as_ref(), &mut output).await?;
                }
            }
        }
    }

    if let Some(minmax) = minmax.as_mut() {
        write_aggregates(minmax, encoder.as_ref(), &mut output).await?;
    }
    Ok(output)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn write_aggregates<W>(
    minmax: &mut MinMax,
    encoder: &dyn execd::codec::MetricEncoder,
    output: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    for aggregate in minmax.aggregates() {
        if let Err(e) = encoder.encode(&aggregate, &mut buf) {
            warn!("dropping aggregate that cannot be encoded: {e}");
        }
    }
    minmax.reset();
    output.write_all(&buf).await.context("failed to write stdout")?;
    output.flush().await.context("failed to flush stdout")?;
    Ok(())
}
