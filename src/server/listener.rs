//! Reference reactor built on tokio
//!
//! One task owns the [`Worker`] and processes events strictly one at a time.
//! Every accepted socket gets its own task that moves bytes between the
//! socket and the worker over channels:
//!
//! - socket reads become [`WorkerEvent::Data`] and end up in
//!   [`Worker::handle_readable`]
//! - the worker's non-blocking writes are `try_send`s into a bounded
//!   per-connection channel; a full channel is reported as `WouldBlock`, and
//!   the connection task raises [`WorkerEvent::Writable`] once it drains
//! - idle timeouts and socket errors become [`WorkerEvent::Closed`], which
//!   takes the same close path as any protocol error

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::error::Result;
use crate::server::config::ServerConfig;
use crate::server::handler::SessionHandler;
use crate::server::worker::Worker;
use crate::session::{SessionId, Transport};

/// Events queued for the worker task
const EVENT_QUEUE: usize = 1024;

/// Bytes read from a socket per call
const SOCKET_READ_SIZE: usize = 16 * 1024;

/// Input to the worker task
enum WorkerEvent {
    Accepted {
        transport: ChannelTransport,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    Data(SessionId, Bytes),
    /// The peer closed its side
    Eof(SessionId),
    /// A previously full outbound channel has room again
    Writable(SessionId),
    /// Idle timeout or socket failure
    Closed(SessionId),
    Shutdown,
}

/// Worker-side end of a connection
pub struct ChannelTransport {
    inbound: BytesMut,
    eof: bool,
    outbound: mpsc::Sender<Bytes>,
    /// Set when a write hit a full channel
    blocked: Arc<AtomicBool>,
}

impl ChannelTransport {
    fn new(outbound: mpsc::Sender<Bytes>, blocked: Arc<AtomicBool>) -> Self {
        Self {
            inbound: BytesMut::new(),
            eof: false,
            outbound,
            blocked,
        }
    }
}

impl Transport for ChannelTransport {
    fn read_available(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        if self.inbound.is_empty() {
            if self.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = self.inbound.len();
        buf.extend_from_slice(&self.inbound.split());
        Ok(n)
    }

    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<usize> {
        let chunk = match self.outbound.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => return Ok(data.len()),
            Err(mpsc::error::TrySendError::Full(chunk)) => chunk,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(io::ErrorKind::BrokenPipe.into())
            }
        };

        // The writer may have emptied the channel before the flag was set, in
        // which case no Writable event would follow; retry once it is visible
        self.blocked.store(true, Ordering::Release);
        match self.outbound.try_send(chunk) {
            Ok(()) => Ok(data.len()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

/// RTMP server
pub struct RtmpServer<H> {
    config: ServerConfig,
    handler: H,
}

impl<H: SessionHandler + Send + 'static> RtmpServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self { config, handler }
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server until the process is stopped
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.config.validate()?;
        let worker = Worker::new(self.config.engine.clone(), self.handler)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let worker_task = tokio::spawn(run_worker(worker, events_rx));

        tracing::info!(addr = %listener.local_addr()?, "RTMP server listening");

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
            }
            _ = accept_loop(&listener, &self.config, &events_tx) => {}
        }

        // Closing every session drops the outbound senders, ending the connection tasks
        let _ = events_tx.send(WorkerEvent::Shutdown).await;
        if let Err(e) = worker_task.await {
            tracing::error!(error = %e, "Worker task failed");
        }
        Ok(())
    }
}

async fn run_worker<H: SessionHandler>(
    mut worker: Worker<ChannelTransport, H>,
    mut events: mpsc::Receiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Accepted { transport, reply } => {
                let id = match worker.accept(transport) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to open session");
                        None
                    }
                };
                let _ = reply.send(id);
            }
            WorkerEvent::Data(id, data) => {
                if let Some(transport) = worker.transport_mut(id) {
                    transport.inbound.extend_from_slice(&data);
                    worker.handle_readable(id);
                }
            }
            WorkerEvent::Eof(id) => {
                if let Some(transport) = worker.transport_mut(id) {
                    transport.eof = true;
                    worker.handle_readable(id);
                }
            }
            WorkerEvent::Writable(id) => {
                worker.handle_writable(id);
            }
            WorkerEvent::Closed(id) => {
                worker.close(id);
            }
            WorkerEvent::Shutdown => break,
        }
    }

    worker.shutdown();
    tracing::debug!("Worker stopped");
}

async fn accept_loop(
    listener: &TcpListener,
    config: &ServerConfig,
    events: &mpsc::Sender<WorkerEvent>,
) {
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        if config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let (out_tx, out_rx) = mpsc::channel(config.channel_capacity);
        let blocked = Arc::new(AtomicBool::new(false));
        let (reply_tx, reply_rx) = oneshot::channel();
        let accepted = WorkerEvent::Accepted {
            transport: ChannelTransport::new(out_tx, Arc::clone(&blocked)),
            reply: reply_tx,
        };
        if events.send(accepted).await.is_err() {
            return;
        }
        let session_id = match reply_rx.await {
            Ok(Some(id)) => id,
            _ => continue,
        };

        tracing::debug!(session_id = session_id, peer = %peer_addr, "New connection");

        let connection = Connection {
            session_id,
            socket,
            outbound: out_rx,
            events: events.clone(),
            blocked,
            idle_timeout: config.idle_timeout,
        };
        tokio::spawn(connection.run());
    }
}

/// Socket side of one session
struct Connection {
    session_id: SessionId,
    socket: TcpStream,
    outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<WorkerEvent>,
    blocked: Arc<AtomicBool>,
    idle_timeout: std::time::Duration,
}

impl Connection {
    async fn run(self) {
        let Connection {
            session_id,
            socket,
            mut outbound,
            events,
            blocked,
            idle_timeout,
        } = self;

        let (mut reader, mut writer) = socket.into_split();
        let mut buf = BytesMut::with_capacity(SOCKET_READ_SIZE);
        let mut reading = true;

        let idle = time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = &mut idle => {
                    tracing::debug!(session_id = session_id, "Idle timeout");
                    let _ = events.send(WorkerEvent::Closed(session_id)).await;
                    break;
                }

                read = reader.read_buf(&mut buf), if reading => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    let event = match read {
                        Ok(0) => {
                            // Keep draining output until the worker drops its side
                            reading = false;
                            WorkerEvent::Eof(session_id)
                        }
                        Ok(_) => {
                            let data = buf.split().freeze();
                            buf.reserve(SOCKET_READ_SIZE);
                            WorkerEvent::Data(session_id, data)
                        }
                        Err(e) => {
                            tracing::debug!(session_id = session_id, error = %e, "Read failed");
                            let _ = events.send(WorkerEvent::Closed(session_id)).await;
                            break;
                        }
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }

                chunk = outbound.recv() => {
                    let data = match chunk {
                        Some(data) => data,
                        // The worker closed the session
                        None => break,
                    };
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    if let Err(e) = writer.write_all(&data).await {
                        tracing::debug!(session_id = session_id, error = %e, "Write failed");
                        let _ = events.send(WorkerEvent::Closed(session_id)).await;
                        break;
                    }
                    if blocked.swap(false, Ordering::AcqRel)
                        && events.send(WorkerEvent::Writable(session_id)).await.is_err()
                    {
                        break;
                    }
                }
            }
        }

        let _ = writer.shutdown().await;
        tracing::debug!(session_id = session_id, "Connection closed");
    }
}
