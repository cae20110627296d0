//! Engine and server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::constants::*;

/// Protocol engine limits, shared by every session of a worker
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk size announced to peers after the handshake
    pub out_chunk_size: u32,

    /// Distinct chunk stream ids a session may use
    pub max_chunk_streams: usize,

    /// Largest message accepted from a peer
    pub max_message_size: u32,

    /// createStream calls allowed per connection
    pub max_message_streams: u32,

    /// Window acknowledgement size announced on connect
    pub window_ack_size: u32,

    /// Peer bandwidth announced on connect
    pub peer_bandwidth: u32,

    /// Shared output buffers in the pool
    pub pool_buffers: usize,

    /// Pooled chunks one session may hold at once
    pub max_queued_chunks: usize,

    /// Outbound messages a session may have waiting before it is dropped as too slow
    pub max_pending_messages: usize,

    /// Check that C2 echoes S1
    pub verify_handshake: bool,

    /// Bytes read from the transport per call
    pub read_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            out_chunk_size: RECOMMENDED_CHUNK_SIZE,
            max_chunk_streams: 64,
            max_message_size: MAX_MESSAGE_SIZE,
            max_message_streams: 16,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            pool_buffers: 4096,
            max_queued_chunks: 256,
            max_pending_messages: 4096,
            verify_handshake: true,
            read_buffer_size: 64 * 1024, // 64KB
        }
    }
}

impl EngineConfig {
    /// Set outgoing chunk size
    pub fn out_chunk_size(mut self, size: u32) -> Self {
        self.out_chunk_size = size;
        self
    }

    pub fn max_chunk_streams(mut self, max: usize) -> Self {
        self.max_chunk_streams = max;
        self
    }

    pub fn max_message_size(mut self, max: u32) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn max_message_streams(mut self, max: u32) -> Self {
        self.max_message_streams = max;
        self
    }

    pub fn window_ack_size(mut self, size: u32) -> Self {
        self.window_ack_size = size;
        self
    }

    pub fn peer_bandwidth(mut self, size: u32) -> Self {
        self.peer_bandwidth = size;
        self
    }

    /// Set the number of shared output buffers
    pub fn pool_buffers(mut self, count: usize) -> Self {
        self.pool_buffers = count;
        self
    }

    pub fn max_queued_chunks(mut self, max: usize) -> Self {
        self.max_queued_chunks = max;
        self
    }

    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.max_pending_messages = max;
        self
    }

    /// Disable the C2 echo check (some embedded encoders send garbage)
    pub fn verify_handshake(mut self, verify: bool) -> Self {
        self.verify_handshake = verify;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Size of one pool buffer: a full chunk plus its largest header
    pub fn pool_buffer_size(&self) -> usize {
        self.out_chunk_size.max(DEFAULT_CHUNK_SIZE) as usize + MAX_CHUNK_HEADER
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.out_chunk_size == 0 || self.out_chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "out_chunk_size must be within 1..={}, got {}",
                MAX_CHUNK_SIZE, self.out_chunk_size
            )));
        }
        if self.max_chunk_streams == 0 {
            return Err(Error::Config("max_chunk_streams must be positive".into()));
        }
        if self.pool_buffers == 0 {
            return Err(Error::Config("pool_buffers must be positive".into()));
        }
        if self.max_queued_chunks == 0 {
            return Err(Error::Config("max_queued_chunks must be positive".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::Config("read_buffer_size must be positive".into()));
        }
        Ok(())
    }
}

/// Reference reactor options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Idle timeout (disconnect if no data received)
    pub idle_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Outbound chunks buffered per connection before writes would block
    pub channel_capacity: usize,

    /// Protocol engine settings
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], RTMP_PORT)),
            idle_timeout: Duration::from_secs(60),
            tcp_nodelay: true, // Important for low latency
            channel_capacity: 64,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Replace the engine settings
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn validate(&self) -> Result<()> {
        // One slot would park the worker on every chunk
        if self.channel_capacity < 2 {
            return Err(Error::Config(format!(
                "channel_capacity must be at least 2, got {}",
                self.channel_capacity
            )));
        }
        self.engine.validate()
    }
}
