mod config;
mod ipc;
mod sync;
mod transport;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let settings = Settings::from_env().context("failed to read configuration")?;
    tracing::info!(api_url = %settings.api_url, "classroomd starting");
    serve(settings).await
}

/// One request per stdin line, one response per stdout line.
///
/// Requests run as separate tasks so a slow save never blocks reads or other
/// pages; responses are written in completion order and matched by `id`.
async fn serve(settings: Settings) -> Result<()> {
    let state = ipc::AppState::new(settings).shared();
    let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(resp) = rx.recv().await {
            let mut line =
                serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("rejected request line: {e}");
                let _ = tx.send(json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() },
                }));
                continue;
            }
        };
        tracing::debug!(id = %req.id, method = %req.method, "request");
        let state = state.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let resp = ipc::handle_request(state, req).await;
            let _ = tx.send(resp);
        });
        // Reap finished tasks so the set does not grow for the whole session.
        while tasks.try_join_next().is_some() {}
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("request task failed: {e}");
        }
    }
    drop(tx);
    let _ = writer.await;
    tracing::info!("stdin closed; exiting");
    Ok(())
}
