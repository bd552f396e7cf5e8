use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tracing::debug;

use super::Resolver;
use super::TrackingId;

#[derive(Debug)]
struct Record {
    resolver: Resolver,
    written: bool,
    awaiting_output: u32,
    awaiting_ack: u32,
    failed: bool,
}

impl Record {
    fn is_settled(&self) -> bool {
        self.written && self.awaiting_output == 0 && self.awaiting_ack == 0
    }
}

/// One metric written to the child, waiting for its outputs.
#[derive(Debug)]
struct Slot {
    id: Option<TrackingId>,
    remaining: u32,
}

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<TrackingId, Record>,
    in_flight: VecDeque<Slot>,
}

type Resolution = (Resolver, TrackingId, bool);

impl TrackerState {
    /// Removes the record if nothing is outstanding anymore.
    fn settle(&mut self, id: TrackingId) -> Option<Resolution> {
        if !self.records.get(&id)?.is_settled() {
            return None;
        }
        let record = self.records.remove(&id)?;
        Some((record.resolver, id, !record.failed))
    }

    /// Takes one expected output from the oldest in-flight slot.
    fn next_output(&mut self) -> Option<TrackingId> {
        let slot = self.in_flight.front_mut()?;
        slot.remaining -= 1;
        let id = slot.id;
        if slot.remaining == 0 {
            self.in_flight.pop_front();
        }
        let id = id?;
        let record = self.records.get_mut(&id)?;
        record.awaiting_output = record.awaiting_output.saturating_sub(1);
        Some(id)
    }
}

/// Bookkeeping between tracked inputs and the outputs the child derives from them.
///
/// Every metric written to the child occupies an in-flight slot expecting
/// `outputs_per_input` outputs. Outputs read back are attributed to the oldest
/// slot. A tracked input resolves once it was written, all of its outputs were
/// produced, and every produced output was acknowledged downstream.
///
/// With `outputs_per_input == 0` no correlation happens: a tracked input
/// resolves as soon as its write to the child completes.
#[derive(Debug, Clone)]
pub struct DeliveryTracker {
    state: Arc<Mutex<TrackerState>>,
    outputs_per_input: u32,
}

impl DeliveryTracker {
    pub fn new(outputs_per_input: u32) -> Self {
        Self {
            state: Arc::default(),
            outputs_per_input,
        }
    }

    pub fn outputs_per_input(&self) -> u32 {
        self.outputs_per_input
    }

    /// Number of tracked inputs not yet resolved.
    pub fn pending(&self) -> usize {
        self.lock().records.len()
    }

    /// Number of written metrics still expecting output.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, id: TrackingId, resolver: Resolver) {
        let previous = self.lock().records.insert(
            id,
            Record {
                resolver,
                written: false,
                awaiting_output: 0,
                awaiting_ack: 0,
                failed: false,
            },
        );
        if let Some(previous) = previous {
            previous.resolver.resolve(id, false);
        }
    }

    /// Resolves a registered input that will never reach the child.
    pub(crate) fn reject(&self, id: TrackingId) {
        let record = self.lock().records.remove(&id);
        if let Some(record) = record {
            record.resolver.resolve(id, false);
        }
    }

    pub(crate) fn write_started(&self, id: Option<TrackingId>) {
        if self.outputs_per_input == 0 {
            return;
        }
        let mut state = self.lock();
        state.in_flight.push_back(Slot {
            id,
            remaining: self.outputs_per_input,
        });
        if let Some(record) = id.and_then(|id| state.records.get_mut(&id)) {
            record.written = true;
            record.awaiting_output = self.outputs_per_input;
        }
    }

    /// A failed write is left to [`Self::abandon_in_flight`] unless outputs are
    /// uncorrelated, in which case the outcome of the write is final.
    pub(crate) fn write_finished(&self, id: Option<TrackingId>, ok: bool) {
        if self.outputs_per_input != 0 {
            return;
        }
        let Some(id) = id else {
            return;
        };
        let record = self.lock().records.remove(&id);
        if let Some(record) = record {
            record.resolver.resolve(id, ok && !record.failed);
        }
    }

    /// Attributes one output to the oldest in-flight input.
    ///
    /// Returns the tracking id the output belongs to, `None` when the output is
    /// untracked or unexpected.
    pub(crate) fn claim_output(&self) -> Option<TrackingId> {
        if self.outputs_per_input == 0 {
            return None;
        }
        let mut state = self.lock();
        let id = state.next_output()?;
        if let Some(record) = state.records.get_mut(&id) {
            record.awaiting_ack += 1;
        }
        Some(id)
    }

    /// Counts an output the child produced but that could not be decoded.
    ///
    /// It still belongs to the oldest in-flight input, which then resolves as
    /// not delivered.
    pub(crate) fn lose_output(&self) {
        if self.outputs_per_input == 0 {
            return;
        }
        let resolution = {
            let mut state = self.lock();
            let Some(id) = state.next_output() else {
                return;
            };
            if let Some(record) = state.records.get_mut(&id) {
                record.failed = true;
            }
            state.settle(id)
        };
        if let Some((resolver, id, delivered)) = resolution {
            resolver.resolve(id, delivered);
        }
    }

    /// Downstream outcome of one derived output.
    pub(crate) fn acknowledge(&self, id: TrackingId, delivered: bool) {
        let resolution = {
            let mut state = self.lock();
            let Some(record) = state.records.get_mut(&id) else {
                return;
            };
            record.awaiting_ack = record.awaiting_ack.saturating_sub(1);
            record.failed |= !delivered;
            state.settle(id)
        };
        if let Some((resolver, id, delivered)) = resolution {
            resolver.resolve(id, delivered);
        }
    }

    /// Gives up on every input written to a child that is gone.
    ///
    /// Outputs already forwarded keep their acknowledgement path; the missing
    /// ones mark the input as not delivered.
    pub(crate) fn abandon_in_flight(&self) {
        let resolutions: Vec<_> = {
            let mut state = self.lock();
            let slots: Vec<_> = state.in_flight.drain(..).collect();
            slots
                .into_iter()
                .filter_map(|slot| {
                    let id = slot.id?;
                    let record = state.records.get_mut(&id)?;
                    record.awaiting_output = 0;
                    record.failed = true;
                    state.settle(id)
                })
                .collect()
        };
        if !resolutions.is_empty() {
            debug!(count = resolutions.len(), "resolving abandoned in-flight metrics");
        }
        for (resolver, id, delivered) in resolutions {
            resolver.resolve(id, delivered);
        }
    }
}
