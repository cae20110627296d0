//! Session notification hooks
//!
//! Implement [`SessionHandler`] to observe what the engine does with each
//! connection. The worker calls these synchronously from its event loop, so
//! implementations must not block. Every method has a no-op default.

use crate::protocol::message::ConnectParams;
use crate::registry::Departure;
use crate::session::SessionId;

/// Notifications raised by the worker
///
/// # Example
///
/// ```
/// use rtmp_engine::server::handler::SessionHandler;
/// use rtmp_engine::session::SessionId;
///
/// struct Counter(usize);
///
/// impl SessionHandler for Counter {
///     fn on_session_closed(&mut self, _id: SessionId) {
///         self.0 += 1;
///     }
/// }
/// ```
pub trait SessionHandler {
    /// A connection was accepted and its handshake armed
    fn on_session_opened(&mut self, _id: SessionId) {}

    /// `connect` succeeded
    fn on_connect(&mut self, _id: SessionId, _params: &ConnectParams) {}

    /// The session became the publisher of `name`
    fn on_publish(&mut self, _id: SessionId, _name: &str) {}

    /// The session joined `name` as a subscriber
    fn on_play(&mut self, _id: SessionId, _name: &str) {}

    /// The session left a broadcast group
    fn on_leave(&mut self, _departure: &Departure) {}

    /// The session is gone; it has already left the registry and released its buffers
    fn on_session_closed(&mut self, _id: SessionId) {}
}

/// Handler that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl SessionHandler for NoopHandler {}
