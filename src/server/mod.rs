//! RTMP server implementation
//!
//! This module provides the server side of the engine:
//! - [`Worker`]: sessions, broadcast registry and buffer pool driven by readiness events
//! - [`CommandTable`]: named command handlers
//! - [`RtmpServer`]: a tokio reactor feeding one worker
//! - [`SessionHandler`]: notification hooks for applications

pub mod config;
pub mod dispatch;
pub mod handler;
pub mod listener;
pub mod worker;

pub use config::{EngineConfig, ServerConfig};
pub use dispatch::{CommandError, CommandTable, DispatchContext};
pub use handler::{NoopHandler, SessionHandler};
pub use listener::RtmpServer;
pub use worker::{SessionStatus, Worker};
