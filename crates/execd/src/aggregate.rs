//! Per-series minimum and maximum of numeric fields.

use fnv::FnvHashMap;

use crate::accumulator::Accumulator;
use crate::metric::current_time_nanos;
use crate::metric::FieldValue;
use crate::metric::Fields;
use crate::metric::Metric;
use crate::metric::Tags;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Range {
    min: f64,
    max: f64,
}

impl Range {
    fn new(value: f64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    fn update(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

#[derive(Debug)]
struct Aggregate {
    name: String,
    tags: Tags,
    fields: Vec<(String, Range)>,
}

/// Keeps the min and max of every numeric field, grouped by series.
///
/// A series is identified by [`Metric::hash_id`]. String and boolean fields
/// are ignored.
#[derive(Debug, Default)]
pub struct MinMax {
    cache: FnvHashMap<u64, Aggregate>,
}

impl MinMax {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn add(&mut self, metric: &Metric) {
        let aggregate = self
            .cache
            .entry(metric.hash_id())
            .or_insert_with(|| Aggregate {
                name: metric.name.clone(),
                tags: metric.tags.clone(),
                fields: Vec::new(),
            });

        for (key, value) in &metric.fields {
            let Some(value) = value.as_f64() else {
                continue;
            };
            match aggregate.fields.iter_mut().find(|(name, _)| name == key) {
                Some((_, range)) => range.update(value),
                None => aggregate.fields.push((key.clone(), Range::new(value))),
            }
        }
    }

    /// One metric per series with `<field>_min` and `<field>_max` fields,
    /// stamped with the current time.
    pub fn aggregates(&self) -> impl Iterator<Item = Metric> + '_ {
        let now = current_time_nanos();
        self.cache
            .values()
            .filter(|aggregate| !aggregate.fields.is_empty())
            .map(move |aggregate| {
                let mut fields = Fields::new();
                for (key, range) in &aggregate.fields {
                    fields.insert(format!("{key}_min"), FieldValue::Float(range.min));
                    fields.insert(format!("{key}_max"), FieldValue::Float(range.max));
                }
                Metric::new(&aggregate.name, aggregate.tags.clone(), fields, now)
            })
    }

    /// Hands every aggregate to `accumulator`.
    pub fn push(&self, accumulator: &dyn Accumulator) {
        for metric in self.aggregates() {
            accumulator.add_metric(metric);
        }
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }
}
