use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;

use super::Queued;
use crate::codec::MetricEncoder;
use crate::tracking::DeliveryTracker;

/// Sole writer of the child's stdin for one generation.
pub(crate) struct Feeder {
    pub name: Arc<str>,
    pub stdin: ChildStdin,
    pub queue: Arc<Mutex<mpsc::Receiver<Queued>>>,
    pub encoder: Arc<dyn MetricEncoder>,
    pub tracker: DeliveryTracker,
    /// instance-wide stop request
    pub shutdown: CancellationToken,
    /// generation teardown
    pub abort: CancellationToken,
    /// raised on a broken stdin
    pub fault: CancellationToken,
}

impl Feeder {
    pub async fn run(mut self) {
        let queue = Arc::clone(&self.queue);
        let mut queue = queue.lock().await;
        let mut buf = BytesMut::with_capacity(4096);
        let mut closing = false;

        loop {
            let queued = tokio::select! {
                biased;
                _ = self.abort.cancelled() => break,
                _ = self.shutdown.cancelled(), if !closing => {
                    // flush what was accepted, then hand the child EOF
                    queue.close();
                    closing = true;
                    continue;
                }
                queued = queue.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };

            buf.clear();
            if let Err(e) = self.encoder.encode(&queued.metric, &mut buf) {
                error!(name = %self.name, metric = %queued.metric.name, "failed to encode metric: {e}");
                if let Some(id) = queued.id {
                    self.tracker.reject(id);
                }
                continue;
            }

            self.tracker.write_started(queued.id);
            let written = tokio::select! {
                biased;
                _ = self.abort.cancelled() => None,
                result = self.stdin.write_all(&buf) => Some(result),
            };
            match written {
                Some(Ok(())) => self.tracker.write_finished(queued.id, true),
                Some(Err(e)) => {
                    self.tracker.write_finished(queued.id, false);
                    error!(name = %self.name, "failed to write to process stdin: {e}");
                    self.fault.cancel();
                    break;
                }
                None => {
                    self.tracker.write_finished(queued.id, false);
                    break;
                }
            }
        }

        debug!(name = %self.name, "feeder finished, closing stdin");
        // dropping stdin delivers EOF to the child
        drop(self.stdin);
    }
}
