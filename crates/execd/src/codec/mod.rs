//! Wire formats spoken with the coprocess.
//!
//! The supervisor only needs two capabilities: turn one [`Metric`] into bytes,
//! and pull one [`Metric`] at a time out of a growing byte buffer. Any format
//! implementing [`MetricEncoder`] and [`MetricDecoder`] can be plugged in.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BufMut;
use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::metric::Metric;

pub mod influx;
pub mod json;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("metric `{name}` has no fields")]
    NoFields { name: String },
    #[error("metric has an empty name")]
    EmptyName,
    #[error("field `{field}` of metric `{name}` is not a finite number")]
    NonFiniteField { name: String, field: String },
    #[error("invalid line protocol `{record}`: {message}")]
    LineProtocol { record: String, message: String },
    #[error("invalid JSON record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Serializes one metric into one complete record.
pub trait MetricEncoder: Send + Sync {
    /// Append the encoding of `metric` to `dst`. On error `dst` is left untouched.
    fn encode(&self, metric: &Metric, dst: &mut BytesMut) -> Result<(), CodecError>;
}

/// Incrementally extracts metrics from a byte stream.
pub trait MetricDecoder: Send {
    /// Consume at most one record from the front of `src`.
    ///
    /// Returns `None` when `src` does not hold a complete record yet.
    /// `Some(Err(_))` reports a malformed record whose bytes were consumed,
    /// so the caller can carry on with the next one.
    fn decode(&mut self, src: &mut BytesMut) -> Option<Result<Metric, CodecError>>;

    /// Called once the stream ended, for records missing their terminator.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Option<Result<Metric, CodecError>> {
        if let Some(decoded) = self.decode(src) {
            return Some(decoded);
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return None;
        }
        src.put_u8(b'\n');
        self.decode(src)
    }
}

/// Builds a fresh decoder for every output stream.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn MetricDecoder> + Send + Sync>;

/// Supported wire formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Influx,
    Json,
}

impl DataFormat {
    pub fn encoder(self) -> Arc<dyn MetricEncoder> {
        match self {
            DataFormat::Influx => Arc::new(influx::InfluxEncoder::new()),
            DataFormat::Json => Arc::new(json::JsonEncoder::new()),
        }
    }

    pub fn decoder(self) -> Box<dyn MetricDecoder> {
        match self {
            DataFormat::Influx => Box::new(influx::InfluxDecoder::new()),
            DataFormat::Json => Box::new(json::JsonDecoder::new()),
        }
    }

    pub fn decoder_factory(self) -> DecoderFactory {
        Arc::new(move || self.decoder())
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Influx => write!(f, "influx"),
            DataFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for DataFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "influx" | "influxdb" | "line" => Ok(DataFormat::Influx),
            "json" => Ok(DataFormat::Json),
            other => Err(format!("unknown data format `{other}`")),
        }
    }
}
