//! estate-standalone: in-process runtime driven by JSON lines
//!
//! Reads one command request per line from stdin, submits it, and writes every
//! recorded event (including those caused by process managers) to stdout as
//! one JSON object per line. Failed requests produce an `{"error": ...}` line.
//!
//! ```text
//! {"aggregate_type":"Account","instance_id":"acc-1","command":"create","payload":{"username":"ada"}}
//! {"aggregate_type":"Account","instance_id":"acc-1","command":"disable"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Logs go to stderr,
//! filtered by `ESTATE_LOG`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use estate::config::Config;
use estate::feed::{EventHandler, FeedError, ALL_TYPES};
use estate::runtime::RuntimeBuilder;
use estate::types::{CommandRequest, Event};
use estate::utils::bootstrap::{init_tracing, parse_config_path};

/// Upper bound on waiting for process managers after stdin closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards every event to the stdout writer.
struct EventPrinter {
    out: mpsc::UnboundedSender<Value>,
}

impl EventHandler for EventPrinter {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, Result<(), FeedError>> {
        let out = self.out.clone();
        Box::pin(async move {
            let line = serde_json::to_value(&*event).map_err(|e| FeedError::HandlerFailed {
                name: "stdout".to_string(),
                message: e.to_string(),
            })?;
            out.send(line).map_err(|_| FeedError::Closed)
        })
    }
}

async fn write_lines(mut lines: mpsc::UnboundedReceiver<Value>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        stdout.write_all(line.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let retry = config.retry.clone();

    info!("Starting estate-standalone");

    let mut runtime = RuntimeBuilder::from_config(config).build().await?;
    runtime.start().await?;

    let (out, lines) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(lines));
    runtime
        .attach("stdout", ALL_TYPES, Arc::new(EventPrinter { out: out.clone() }))
        .await?;

    let intake = runtime.intake();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    let mut failed = 0u64;

    loop {
        let line = tokio::select! {
            line = input.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let result = match serde_json::from_str::<CommandRequest>(trimmed) {
            Ok(request) => intake
                .submit_with_retry(request, &retry)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("invalid request: {e}")),
        };

        if let Err(reason) = result {
            failed += 1;
            warn!(line = line_no, error = %reason, "Command failed");
            // Fails only if the writer already stopped on an I/O error.
            let _ = out.send(json!({"line": line_no, "error": reason}));
        }
    }

    if !runtime.settle(DRAIN_TIMEOUT).await {
        warn!("Process managers did not drain before timeout");
    }
    runtime.shutdown().await;
    drop(out);
    writer.await??;

    info!(lines = line_no, failed, "estate-standalone finished");
    Ok(())
}
