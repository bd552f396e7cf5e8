use bytes::BufMut;
use bytes::BytesMut;

use super::CodecError;
use super::MetricDecoder;
use super::MetricEncoder;
use crate::metric::FieldValue;
use crate::metric::Metric;

/// Newline-delimited JSON encoder, one object per metric:
/// `{"name":..,"tags":{..},"fields":{..},"timestamp":..}`
pub struct JsonEncoder;

impl JsonEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricEncoder for JsonEncoder {
    fn encode(&self, metric: &Metric, dst: &mut BytesMut) -> Result<(), CodecError> {
        if metric.name.is_empty() {
            return Err(CodecError::EmptyName);
        }
        if metric.fields.is_empty() {
            return Err(CodecError::NoFields {
                name: metric.name.clone(),
            });
        }
        // serde_json would silently write `null` for these
        if let Some((field, _)) = metric
            .fields
            .iter()
            .find(|(_, value)| matches!(value, FieldValue::Float(f) if !f.is_finite()))
        {
            return Err(CodecError::NonFiniteField {
                name: metric.name.clone(),
                field: field.clone(),
            });
        }

        let encoded = serde_json::to_vec(metric)?;
        dst.reserve(encoded.len() + 1);
        dst.extend_from_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Decodes one JSON object per line. Blank lines are skipped.
#[derive(Default)]
pub struct JsonDecoder {
    // bytes already searched for a newline
    scanned: usize,
}

impl JsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricDecoder for JsonDecoder {
    fn decode(&mut self, src: &mut BytesMut) -> Option<Result<Metric, CodecError>> {
        loop {
            let start = self.scanned.min(src.len());
            let offset = src[start..].iter().position(|b| *b == b'\n');
            let Some(offset) = offset else {
                self.scanned = src.len();
                return None;
            };
            let line = src.split_to(start + offset + 1);
            self.scanned = 0;

            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            return Some(serde_json::from_slice::<Metric>(trimmed).map_err(CodecError::from));
        }
    }
}
