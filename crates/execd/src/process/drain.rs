use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tracing::debug;
use tracing::warn;

use crate::accumulator::Accumulator;
use crate::codec::CodecError;
use crate::codec::MetricDecoder;
use crate::metric::Metric;
use crate::tracking::DeliveryTracker;
use crate::tracking::TrackedMetric;

/// Reads the child's stdout and forwards decoded metrics downstream in order.
pub(crate) struct Drain {
    pub name: Arc<str>,
    pub stdout: ChildStdout,
    pub decoder: Box<dyn MetricDecoder>,
    pub tracker: DeliveryTracker,
    pub accumulator: Arc<dyn Accumulator>,
}

impl Drain {
    pub async fn run(mut self) {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            match self.stdout.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while let Some(decoded) = self.decoder.decode(&mut buf) {
                        self.handle(decoded);
                    }
                }
                Err(e) => {
                    warn!(name = %self.name, "failed to read process stdout: {e}");
                    break;
                }
            }
        }

        while let Some(decoded) = self.decoder.decode_eof(&mut buf) {
            self.handle(decoded);
        }
        debug!(name = %self.name, "stdout closed");
    }

    fn handle(&self, decoded: Result<Metric, CodecError>) {
        match decoded {
            Ok(metric) => self.forward(metric),
            Err(e) => {
                warn!(name = %self.name, "skipping malformed output: {e}");
                self.tracker.lose_output();
            }
        }
    }

    fn forward(&self, metric: Metric) {
        match self.tracker.claim_output() {
            Some(id) => self.accumulator.add_tracking_metric(TrackedMetric::derived(
                metric,
                id,
                self.tracker.clone(),
            )),
            None => self.accumulator.add_metric(metric),
        }
    }
}
