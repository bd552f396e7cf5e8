//! Streaming metric transformation through a supervised coprocess.
//!
//! An external program is run as a long-lived child. Metrics are serialized
//! onto its stdin, whatever it prints on stdout is parsed back into metrics
//! and handed to an [`Accumulator`], and its stderr is logged. The child is
//! restarted if it exits on its own.
//!
//! # Features
//!
//! - InfluxDB line protocol and JSON wire formats
//! - Delivery tracking from an input metric to all outputs derived from it
//! - Bounded input queue with backpressure
//! - Min/max aggregation of numeric fields per series
//!
//! # Examples
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use execd::{ChannelAccumulator, Execd, ExecdConfig, Metric};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ExecdConfig::new(["/usr/local/bin/transform"]);
//! let execd = Execd::new(config)?;
//!
//! let (accumulator, mut outputs) = ChannelAccumulator::new();
//! execd.start(Arc::new(accumulator)).await?;
//! execd.add(Metric::now("cpu").with_field("usage", 0.5)).await?;
//!
//! if let Some(output) = outputs.recv().await {
//!     println!("{:?}", output.accept());
//! }
//! execd.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod aggregate;
pub mod codec;
pub mod config;
pub mod error;
pub mod metric;
pub mod process;
pub mod tracking;

pub use accumulator::Accumulator;
pub use accumulator::ChannelAccumulator;
pub use accumulator::Emitted;
pub use aggregate::MinMax;
pub use codec::DataFormat;
pub use config::ExecdConfig;
pub use error::ExecdError;
pub use error::ExecdResult;
pub use metric::FieldValue;
pub use metric::Metric;
pub use process::Execd;
pub use process::Lifecycle;
pub use tracking::DeliveryInfo;
pub use tracking::TrackedMetric;
pub use tracking::TrackingId;
