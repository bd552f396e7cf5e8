use bytes::BytesMut;
use influxdb_line_protocol::parse_lines;
use influxdb_line_protocol::FieldValue as LineFieldValue;
use influxdb_line_protocol::LineProtocolBuilder;
use influxdb_line_protocol::ParsedLine;

use super::CodecError;
use super::MetricDecoder;
use super::MetricEncoder;
use crate::metric::current_time_nanos;
use crate::metric::FieldValue;
use crate::metric::Fields;
use crate::metric::Metric;
use crate::metric::Tags;

/// InfluxDB line protocol encoder
pub struct InfluxEncoder;

impl InfluxEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for InfluxEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricEncoder for InfluxEncoder {
    fn encode(&self, metric: &Metric, dst: &mut BytesMut) -> Result<(), CodecError> {
        if metric.name.is_empty() {
            return Err(CodecError::EmptyName);
        }
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

        let mut builder = LineProtocolBuilder::new().measurement(&metric.name);
        for (key, value) in &metric.tags {
            builder = builder.tag(key, value);
        }

        // The first field moves the builder into its AfterField state
        let mut fields = metric.fields.iter();
        let Some((first_key, first_value)) = fields.next() else {
            return Err(CodecError::NoFields {
                name: metric.name.clone(),
            });
        };
        let mut after_first_field = match first_value {
            FieldValue::String(s) => builder.field(first_key, s.as_str()),
            FieldValue::Integer(i) => builder.field(first_key, *i),
            FieldValue::UnsignedInteger(u) => builder.field(first_key, *u),
            FieldValue::Float(f) => builder.field(first_key, *f),
            FieldValue::Boolean(b) => builder.field(first_key, *b),
        };

        for (key, value) in fields {
            after_first_field = match value {
                FieldValue::String(s) => after_first_field.field(key, s.as_str()),
                FieldValue::Integer(i) => after_first_field.field(key, *i),
                FieldValue::UnsignedInteger(u) => after_first_field.field(key, *u),
                FieldValue::Float(f) => after_first_field.field(key, *f),
                FieldValue::Boolean(b) => after_first_field.field(key, *b),
            };
        }

        let line = after_first_field
            .timestamp(metric.timestamp)
            .close_line()
            .build();
        dst.extend_from_slice(&line);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Section {
    /// Leading whitespace before anything else on the line
    #[default]
    Start,
    Comment,
    /// Measurement and tag set
    Series,
    Fields,
    Timestamp,
}

/// Finds record boundaries in a line protocol byte stream.
///
/// A newline ends a record unless it is escaped or sits inside a quoted string
/// field value. The scan resumes where it stopped when more bytes arrive.
#[derive(Debug, Default)]
struct RecordScanner {
    offset: usize,
    section: Section,
    escaped: bool,
    quoted: bool,
    after_equals: bool,
}

impl RecordScanner {
    /// Length of the first complete record in `buf`, terminator included.
    fn next_record(&mut self, buf: &[u8]) -> Option<usize> {
        while self.offset < buf.len() {
            let byte = buf[self.offset];
            self.offset += 1;

            if self.escaped {
                self.escaped = false;
                continue;
            }
            if byte == b'\\' && self.section != Section::Comment {
                self.escaped = true;
                self.after_equals = false;
                continue;
            }
            if byte == b'\n' && !self.quoted {
                let len = self.offset;
                *self = Self::default();
                return Some(len);
            }

            match self.section {
                Section::Start => match byte {
                    b' ' | b'\t' | b'\r' => {}
                    b'#' => self.section = Section::Comment,
                    _ => self.section = Section::Series,
                },
                Section::Comment | Section::Timestamp => {}
                Section::Series => {
                    if byte == b' ' {
                        self.section = Section::Fields;
                    }
                }
                Section::Fields => {
                    if self.quoted {
                        if byte == b'"' {
                            self.quoted = false;
                        }
                    } else {
                        match byte {
                            b'"' if self.after_equals => self.quoted = true,
                            b' ' => self.section = Section::Timestamp,
                            _ => {}
                        }
                        self.after_equals = byte == b'=';
                    }
                }
            }
        }
        None
    }
}

/// Streaming InfluxDB line protocol decoder
#[derive(Debug, Default)]
pub struct InfluxDecoder {
    scanner: RecordScanner,
}

impl InfluxDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricDecoder for InfluxDecoder {
    fn decode(&mut self, src: &mut BytesMut) -> Option<Result<Metric, CodecError>> {
        loop {
            let len = self.scanner.next_record(src)?;
            let record = src.split_to(len);
            if let Some(decoded) = parse_record(&record) {
                return Some(decoded);
            }
        }
    }
}

/// Parses one framed record, `None` for blank lines and comments.
fn parse_record(record: &[u8]) -> Option<Result<Metric, CodecError>> {
    let text = match std::str::from_utf8(record) {
        Ok(text) => text,
        Err(err) => return Some(Err(err.into())),
    };
    let text = text.trim_end_matches(['\n', '\r']).trim_start();
    if text.is_empty() || text.starts_with('#') {
        return None;
    }

    match parse_lines(text).next()? {
        Ok(line) => Some(Ok(into_metric(line))),
        Err(err) => Some(Err(CodecError::LineProtocol {
            record: text.to_string(),
            message: err.to_string(),
        })),
    }
}

fn into_metric(line: ParsedLine<'_>) -> Metric {
    let tags: Tags = match &line.series.tag_set {
        Some(tag_set) => tag_set
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        None => Tags::new(),
    };

    let fields: Fields = line
        .field_set
        .iter()
        .map(|(key, value)| {
            let value = match value {
                LineFieldValue::I64(i) => FieldValue::Integer(*i),
                LineFieldValue::U64(u) => FieldValue::UnsignedInteger(*u),
                LineFieldValue::F64(f) => FieldValue::Float(*f),
                LineFieldValue::String(s) => FieldValue::String(s.to_string()),
                LineFieldValue::Boolean(b) => FieldValue::Boolean(*b),
            };
            (key.to_string(), value)
        })
        .collect();

    Metric::new(
        line.series.measurement.to_string(),
        tags,
        fields,
        line.timestamp.unwrap_or_else(current_time_nanos),
    )
}
