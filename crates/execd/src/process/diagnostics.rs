use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::ChildStderr;
use tracing::error;

/// Tracing target for everything the child writes to stderr.
pub const DIAGNOSTICS_TARGET: &str = "execd::diagnostics";

/// Logs each stderr line of the child at error level until the stream ends.
pub(crate) async fn run(name: Arc<str>, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\r', '\n']);
                if !text.is_empty() {
                    error!(target: DIAGNOSTICS_TARGET, "[{name}] {text}");
                }
            }
        }
    }
}
