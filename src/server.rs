// Copyright 2020 Joyent, Inc.

//! This module provides the interface for running an RFIO server. Each
//! accepted control connection becomes a [`Session`](crate::session::Session)
//! running in its own task; sessions share nothing but the
//! [`ServerContext`].

use std::sync::Arc;

use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::RfioError;
use crate::session::{ServerContext, Session};

fn fallback_logger() -> Logger {
    Logger::root(slog_stdlog::StdLog.fuse(), o!())
}

/// Create a task that serves one control connection. Pass a logger to have
/// session events logged under it; otherwise they go to the `log` crate.
pub async fn make_task(
    socket: TcpStream,
    ctx: Arc<ServerContext>,
    log: Option<&Logger>,
) {
    let log = log.cloned().unwrap_or_else(fallback_logger);
    let session = match Session::new(socket, ctx, &log) {
        Ok(session) => session,
        Err(e) => {
            error!(log, "failed to set up session"; "err" => %e);
            return;
        }
    };
    if let Err(e) = session.run().await {
        error!(log, "session failed"; "err" => %e, "errno" => e.errno());
    }
}

/// Accept control connections on `listener` until `cancel` fires, spawning
/// a task per connection. Sessions already running are left to finish.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
    log: Option<&Logger>,
) -> Result<(), RfioError> {
    let log = log.cloned().unwrap_or_else(fallback_logger);
    info!(log, "listening for rfio requests"; "address" => %listener.local_addr()?);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(log, "shutting down listener");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(log, "accepted control connection"; "peer" => %peer);
                    let task_ctx = Arc::clone(&ctx);
                    let task_log = log.clone();
                    tokio::spawn(async move {
                        make_task(socket, task_ctx, Some(&task_log)).await
                    });
                }
                Err(e) => error!(log, "failed to accept socket"; "err" => %e),
            },
        }
    }
}
