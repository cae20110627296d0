//! rtmp-engine: RTMP protocol engine
//!
//! This library provides the server side of RTMP as a non-blocking engine:
//! - Plain handshake (C0/C1/C2, S0/S1/S2)
//! - Chunk stream demultiplexing and multiplexing with header compression
//! - AMF0 command dispatch (connect, createStream, publish, play, ...)
//! - Live fan-out from one publisher to many subscribers per stream name
//! - Shared, bounded output buffer pool with deferred writes
//!
//! The engine never performs I/O itself. A reactor hands it bytes through the
//! [`session::Transport`] trait and calls [`Worker::handle_readable`],
//! [`Worker::handle_writable`] and [`Worker::close`]. [`RtmpServer`] is a
//! ready-made tokio reactor.
//!
//! # Example: Simple Server
//!
//! ```no_run
//! use rtmp_engine::{RtmpServer, ServerConfig, SessionHandler};
//! use rtmp_engine::session::SessionId;
//!
//! struct MyHandler;
//!
//! impl SessionHandler for MyHandler {
//!     fn on_publish(&mut self, _id: SessionId, name: &str) {
//!         println!("Stream published: {}", name);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RtmpServer::new(ServerConfig::default(), MyHandler);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use registry::BroadcastRegistry;
pub use server::config::{EngineConfig, ServerConfig};
pub use server::handler::SessionHandler;
pub use server::listener::RtmpServer;
pub use server::worker::Worker;
