//! Graceful shutdown on SIGINT/SIGTERM: closes both store client handles so
//! in-flight sockets are released before the process exits, instead of an
//! ungraceful kill.

use tokio::signal::unix::{signal, SignalKind};

use crate::context::RunContext;

/// Resolves as soon as SIGINT or SIGTERM arrives. Race this against the
/// applier's `run` future with `tokio::select!` at the call site so the
/// store gets closed no matter which future finishes first.
pub async fn wait_for_signal(ctx: &RunContext) {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(err) => {
            ctx.logger
                .log(format!("failed to install SIGINT handler: {}", err));
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            ctx.logger
                .log(format!("failed to install SIGTERM handler: {}", err));
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = sigint.recv() => ctx.logger.log("received SIGINT, shutting down gracefully"),
        _ = sigterm.recv() => ctx.logger.log("received SIGTERM, shutting down gracefully"),
    }

    ctx.shutdown().await;
}
