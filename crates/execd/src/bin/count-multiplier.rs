//! Test coprocess: doubles one numeric field of every metric read from stdin.
//!
//! Environment:
//! - `FIELD_NAME` field to double, `count` by default
//! - `DATA_FORMAT` wire format on both streams, `influx` by default
//! - `COPIES` outputs written per input, 1 by default
//! - `EXIT_AFTER` exit with status 3 after this many inputs

use std::process::exit;

use bytes::BytesMut;
use execd::codec::CodecError;
use execd::DataFormat;
use execd::FieldValue;
use execd::Metric;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            eprintln!("invalid value for {key}: {value}");
            exit(1)
        }),
        Err(_) => default,
    }
}

fn multiply(mut metric: Metric, field: &str) -> Metric {
    let doubled = match metric.field(field) {
        Some(FieldValue::Integer(i)) => FieldValue::Integer(i * 2),
        Some(FieldValue::UnsignedInteger(u)) => FieldValue::UnsignedInteger(u * 2),
        Some(FieldValue::Float(f)) => FieldValue::Float(f * 2.0),
        Some(other) => {
            eprintln!("{field} is not a number, it's {other:?}");
            exit(1)
        }
        None => {
            eprintln!("metric has no {field} field");
            exit(1)
        }
    };
    metric.set_field(field, doubled);
    metric
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let field = env_or("FIELD_NAME", "count".to_string());
    let format = env_or("DATA_FORMAT", DataFormat::Influx);
    let copies = env_or("COPIES", 1usize);
    let exit_after = env_or("EXIT_AFTER", 0usize);

    let encoder = format.encoder();
    let mut decoder = format.decoder();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut input = BytesMut::with_capacity(8192);
    let mut output = BytesMut::new();
    let mut processed = 0usize;
    let mut eof = false;

    while !eof {
        match stdin.read_buf(&mut input).await {
            Ok(0) => eof = true,
            Ok(_) => {}
            Err(e) => {
                eprintln!("ERR {e}");
                exit(1)
            }
        }

        loop {
            let decoded = if eof {
                decoder.decode_eof(&mut input)
            } else {
                decoder.decode(&mut input)
            };
            let metric = match decoded {
                None => break,
                Some(Ok(metric)) => metric,
                Some(Err(e)) => {
                    eprintln!("parse ERR {e}");
                    exit(1)
                }
            };

            let metric = multiply(metric, &field);
            output.clear();
            for _ in 0..copies {
                if let Err(e) = encoder.encode(&metric, &mut output) {
                    report_and_exit(e);
                }
            }
            if let Err(e) = write(&mut stdout, &output).await {
                eprintln!("ERR {e}");
                exit(1)
            }

            processed += 1;
            if exit_after > 0 && processed >= exit_after {
                eprintln!("exiting after {processed} metrics");
                exit(3)
            }
        }
    }
}

async fn write(stdout: &mut tokio::io::Stdout, bytes: &[u8]) -> std::io::Result<()> {
    stdout.write_all(bytes).await?;
    stdout.flush().await
}

fn report_and_exit(e: CodecError) -> ! {
    eprintln!("ERR {e}");
    exit(1)
}
