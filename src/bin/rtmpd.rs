//! Live RTMP relay server
//!
//! Run with: cargo run --bin rtmpd -- [bind address]
//!
//! ## Publishing (send stream)
//!
//! With ffmpeg:
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test
//!
//! ## Playing (receive stream)
//!
//! With ffplay:
//!   ffplay rtmp://localhost/live/test
//!
//! Log verbosity follows `RUST_LOG`, e.g. `RUST_LOG=rtmp_engine=debug`.

use std::net::SocketAddr;

use rtmp_engine::protocol::message::ConnectParams;
use rtmp_engine::registry::{Departure, Role};
use rtmp_engine::session::SessionId;
use rtmp_engine::{RtmpServer, ServerConfig, SessionHandler};

/// Logs the lifecycle of every session
struct LogHandler;

impl SessionHandler for LogHandler {
    fn on_connect(&mut self, id: SessionId, params: &ConnectParams) {
        tracing::info!(
            session_id = id,
            app = %params.app,
            tc_url = ?params.tc_url,
            "Client connected"
        );
    }

    fn on_publish(&mut self, id: SessionId, name: &str) {
        tracing::info!(session_id = id, stream = %name, "Stream published");
    }

    fn on_play(&mut self, id: SessionId, name: &str) {
        tracing::info!(session_id = id, stream = %name, "Player joined");
    }

    fn on_leave(&mut self, departure: &Departure) {
        if departure.role == Role::Publisher {
            tracing::info!(
                session_id = departure.session,
                stream = %departure.name,
                subscribers = departure.remaining_subscribers.len(),
                "Stream unpublished"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_engine=info".parse()?)
                .add_directive("rtmpd=info".parse()?),
        )
        .init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        let addr: SocketAddr = addr.parse()?;
        config = config.bind(addr);
    }

    let server = RtmpServer::new(config, LogHandler);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
