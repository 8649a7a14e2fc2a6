//! Local balloon socket.
//!
//! A client writes one line holding a byte count and gets `OK` or `FAIL` back.
//! The state lock stays held until the client hangs up (or `hold` expires), so
//! a domain can be started in the freed memory before any balance pass hands
//! it back out.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::core::SystemState;
use crate::AsyncMutex;

/// Longest request line accepted, newline included.
const MAX_REQUEST_LEN: u64 = 64;

pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

pub async fn serve(
    listener: UnixListener,
    state: Arc<AsyncMutex<SystemState>>,
    hold: Duration,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(path = ?addr.as_pathname(), "Balloon socket listening");
    }

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, state, hold).await {
                warn!(error = %e, "Balloon client failed");
            }
        });
    }
}

async fn handle_client(
    stream: UnixStream,
    state: Arc<AsyncMutex<SystemState>>,
    hold: Duration,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    if (&mut reader).take(MAX_REQUEST_LEN).read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let mut balancer = state.lock().await;
    let reply = match line.trim().parse::<u64>() {
        Ok(amount) => {
            if balancer.request_balloon(amount).await {
                "OK\n"
            } else {
                "FAIL\n"
            }
        }
        Err(_) => {
            warn!(request = %line.trim(), "Malformed balloon request");
            "FAIL\n"
        }
    };
    writer.write_all(reply.as_bytes()).await?;

    let mut sink = [0u8; 64];
    let hung_up = tokio::time::timeout(hold, async {
        while let Ok(n) = reader.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
    if hung_up.is_err() {
        debug!("Balloon client held the lock too long, releasing");
    }
    drop(balancer);
    Ok(())
}
