//! Delivery tracking.
//!
//! A [`TrackedMetric`] carries an obligation: whoever ends up holding it must
//! eventually [`accept`](TrackedMetric::accept) or [`reject`](TrackedMetric::reject)
//! it, and its resolver runs exactly once with the outcome. Dropping an
//! unresolved tracked metric counts as a rejection.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::metric::Metric;

mod tracker;

pub use tracker::DeliveryTracker;

static NEXT_TRACKING_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque token correlating a metric with its delivery obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackingId(u64);

impl TrackingId {
    pub fn next() -> Self {
        Self(NEXT_TRACKING_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome handed to a notify callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub id: TrackingId,
    pub delivered: bool,
}

pub type NotifyFn = Box<dyn FnOnce(DeliveryInfo) + Send>;

pub(crate) enum Resolver {
    /// Caller supplied callback
    Notify(NotifyFn),
    /// Output derived from a tracked input, acknowledged back into the tracker
    Tracker(DeliveryTracker),
}

impl Resolver {
    pub(crate) fn resolve(self, id: TrackingId, delivered: bool) {
        match self {
            Resolver::Notify(notify) => notify(DeliveryInfo { id, delivered }),
            Resolver::Tracker(tracker) => tracker.acknowledge(id, delivered),
        }
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolver::Notify(_) => f.write_str("Notify"),
            Resolver::Tracker(_) => f.write_str("Tracker"),
        }
    }
}

/// The resolve-once half of a tracked metric.
#[derive(Debug)]
pub(crate) struct Delivery {
    id: TrackingId,
    resolver: Option<Resolver>,
}

impl Delivery {
    pub(crate) fn id(&self) -> TrackingId {
        self.id
    }

    /// Moves the obligation elsewhere; the emptied delivery no longer resolves on drop.
    pub(crate) fn take_resolver(&mut self) -> Option<Resolver> {
        self.resolver.take()
    }

    fn resolve(&mut self, delivered: bool) {
        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(self.id, delivered);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.resolve(false);
    }
}

/// A metric whose delivery outcome is reported back to its producer.
#[derive(Debug)]
pub struct TrackedMetric {
    metric: Metric,
    delivery: Delivery,
}

impl TrackedMetric {
    pub fn new(metric: Metric, notify: impl FnOnce(DeliveryInfo) + Send + 'static) -> Self {
        Self {
            metric,
            delivery: Delivery {
                id: TrackingId::next(),
                resolver: Some(Resolver::Notify(Box::new(notify))),
            },
        }
    }

    pub(crate) fn derived(metric: Metric, id: TrackingId, tracker: DeliveryTracker) -> Self {
        Self {
            metric,
            delivery: Delivery {
                id,
                resolver: Some(Resolver::Tracker(tracker)),
            },
        }
    }

    pub fn id(&self) -> TrackingId {
        self.delivery.id
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn metric_mut(&mut self) -> &mut Metric {
        &mut self.metric
    }

    /// Marks the metric as delivered.
    pub fn accept(mut self) {
        self.delivery.resolve(true);
    }

    /// Marks the metric as not delivered.
    pub fn reject(mut self) {
        self.delivery.resolve(false);
    }

    pub(crate) fn into_parts(self) -> (Metric, Delivery) {
        (self.metric, self.delivery)
    }
}

/// Anything that can be handed to [`crate::Execd::add`].
#[derive(Debug)]
pub enum Input {
    Untracked(Metric),
    Tracked(TrackedMetric),
}

impl Input {
    pub fn metric(&self) -> &Metric {
        match self {
            Input::Untracked(metric) => metric,
            Input::Tracked(tracked) => tracked.metric(),
        }
    }
}

impl From<Metric> for Input {
    fn from(metric: Metric) -> Self {
        Input::Untracked(metric)
    }
}

impl From<TrackedMetric> for Input {
    fn from(tracked: TrackedMetric) -> Self {
        Input::Tracked(tracked)
    }
}
