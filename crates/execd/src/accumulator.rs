use tokio::sync::mpsc;
use tracing::debug;

use crate::metric::current_time_nanos;
use crate::metric::Fields;
use crate::metric::Metric;
use crate::metric::Tags;
use crate::tracking::TrackedMetric;

/// Downstream collaborator receiving transformed metrics.
pub trait Accumulator: Send + Sync {
    fn add_metric(&self, metric: Metric);

    /// The receiver takes over the delivery obligation of `metric`.
    fn add_tracking_metric(&self, metric: TrackedMetric);

    fn add_fields(&self, name: &str, fields: Fields, tags: Tags) {
        self.add_metric(Metric::new(name, tags, fields, current_time_nanos()));
    }
}

/// A metric handed to a [`ChannelAccumulator`].
#[derive(Debug)]
pub enum Emitted {
    Untracked(Metric),
    Tracked(TrackedMetric),
}

impl Emitted {
    pub fn metric(&self) -> &Metric {
        match self {
            Emitted::Untracked(metric) => metric,
            Emitted::Tracked(tracked) => tracked.metric(),
        }
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self, Emitted::Tracked(_))
    }

    /// Acknowledges delivery and hands the metric back.
    pub fn accept(self) -> Metric {
        match self {
            Emitted::Untracked(metric) => metric,
            Emitted::Tracked(tracked) => {
                let metric = tracked.metric().clone();
                tracked.accept();
                metric
            }
        }
    }

    pub fn reject(self) {
        if let Emitted::Tracked(tracked) = self {
            tracked.reject();
        }
    }
}

/// Forwards everything into an unbounded channel.
///
/// Tracked metrics that cannot be sent because the receiver is gone are
/// dropped, which resolves them as not delivered.
#[derive(Debug, Clone)]
pub struct ChannelAccumulator {
    tx: mpsc::UnboundedSender<Emitted>,
}

impl ChannelAccumulator {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Emitted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Accumulator for ChannelAccumulator {
    fn add_metric(&self, metric: Metric) {
        if self.tx.send(Emitted::Untracked(metric)).is_err() {
            debug!("accumulator receiver closed, dropping metric");
        }
    }

    fn add_tracking_metric(&self, metric: TrackedMetric) {
        if self.tx.send(Emitted::Tracked(metric)).is_err() {
            debug!("accumulator receiver closed, dropping tracked metric");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::metric::FieldValue;

    #[test]
    fn test_add_fields_builds_metric() {
        let (acc, mut rx) = ChannelAccumulator::new();
        let mut fields = Fields::new();
        fields.insert("value_min".into(), FieldValue::Float(1.0));
        let mut tags = Tags::new();
        tags.insert("host".into(), "a".into());

        acc.add_fields("cpu", fields.clone(), tags.clone());

        let emitted = rx.try_recv().unwrap();
        assert!(!emitted.is_tracked());
        let metric = emitted.accept();
        assert_eq!(metric.name, "cpu");
        assert_eq!(metric.fields, fields);
        assert_eq!(metric.tags, tags);
    }

    #[test]
    fn test_closed_receiver_rejects_tracked_metric() {
        let (acc, rx) = ChannelAccumulator::new();
        drop(rx);

        let delivered = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&delivered);
        acc.add_tracking_metric(TrackedMetric::new(Metric::now("m"), move |info| {
            flag.store(info.delivered, Ordering::SeqCst)
        }));

        assert!(!delivered.load(Ordering::SeqCst));
    }
}
