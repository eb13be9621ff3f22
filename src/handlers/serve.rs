//! Standalone stdio gateway
//!
//! Owns the backend fleet in-process and speaks MCP on stdin/stdout.
//! Logging stays on stderr because stdout carries protocol frames.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::broadcast;

use crate::gateway::{Gateway, Outcome};
use crate::router::RouterEvent;

use super::{build_fleet, load_provider};

const CLIENT_ID: &str = "stdio";

pub async fn run_serve(config: Option<PathBuf>) -> Result<()> {
    let provider = load_provider(config)?;
    let router = build_fleet(&provider).await?;
    let gateway = Gateway::new(router.clone());

    let ready = gateway.wait_for_tools_ready().await;
    let (connected, total) = router.counts().await;
    tracing::info!("gateway ready: {connected}/{total} servers, {ready} tools");

    let mut events = router.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("stdin read failed")? else {
                    tracing::info!("stdin closed, shutting down");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                if let Outcome::Respond(response) = gateway.handle_line(CLIENT_ID, &line).await {
                    write_json_line(&mut stdout, &response).await?;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(RouterEvent::RoutesUpdated { .. }) => {
                        if let Some((_, notification)) =
                            gateway.tools_changed_notification().await
                        {
                            write_json_line(&mut stdout, &notification).await?;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("dropped {n} router events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    router.disconnect_all().await;
    Ok(())
}

async fn write_json_line<T: serde::Serialize>(stdout: &mut Stdout, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
