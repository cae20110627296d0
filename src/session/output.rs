//! Outbound buffering
//!
//! Outgoing messages wait in a per-session queue until they can be chunked
//! into buffers drawn from the worker's [`BufferPool`]. Each pooled buffer
//! holds exactly one chunk and belongs to exactly one session until the
//! transport has taken all of its bytes, at which point it goes back to the
//! pool. Payloads are shared between subscribers through `Bytes` reference
//! counting; only the chunked wire form is per session.
//!
//! An empty pool defers the write; nothing is dropped.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};

use crate::protocol::chunk::{ChunkEncoder, OutgoingMessage, RtmpPacket};
use crate::session::Transport;

/// Fixed-size output buffers shared by every session of one worker
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<BytesMut>,
    buffer_size: usize,
    capacity: usize,
    outstanding: usize,
}

impl BufferPool {
    /// `capacity` buffers of `buffer_size` bytes each, allocated lazily
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            free: Vec::new(),
            buffer_size,
            capacity,
            outstanding: 0,
        }
    }

    /// Take a buffer, or `None` while every buffer is in use
    pub fn acquire(&mut self) -> Option<BytesMut> {
        if self.outstanding >= self.capacity {
            return None;
        }
        self.outstanding += 1;
        Some(
            self.free
                .pop()
                .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size)),
        )
    }

    /// Return a buffer taken with [`acquire`](Self::acquire)
    pub fn release(&mut self, mut buf: BytesMut) {
        buf.clear();
        self.outstanding = self.outstanding.saturating_sub(1);
        if buf.capacity() >= self.buffer_size {
            self.free.push(buf);
        }
    }

    /// Buffers currently handed out
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn available(&self) -> usize {
        self.capacity - self.outstanding
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Result of a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Everything queued has been handed to the transport
    Done,
    /// The transport would block; resume on writability
    Blocked,
    /// Messages are waiting for a pool buffer
    Starved,
}

#[derive(Debug)]
enum ReadyChunk {
    Pooled { buf: BytesMut, pos: usize },
    Raw { data: Bytes },
}

impl ReadyChunk {
    fn remaining(&self) -> &[u8] {
        match self {
            ReadyChunk::Pooled { buf, pos } => &buf[*pos..],
            ReadyChunk::Raw { data } => data,
        }
    }

    fn advance(&mut self, n: usize) {
        match self {
            ReadyChunk::Pooled { pos, .. } => *pos += n,
            ReadyChunk::Raw { data } => {
                let _ = data.split_to(n);
            }
        }
    }
}

/// Per-session outbound queue
#[derive(Debug)]
pub struct OutputQueue {
    /// Messages not yet fully chunked, in send order
    pending: VecDeque<OutgoingMessage>,
    /// Wire bytes waiting for the transport, in send order
    ready: VecDeque<ReadyChunk>,
    /// Pooled chunks a session may hold at once
    max_ready: usize,
}

impl OutputQueue {
    pub fn new(max_ready: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            max_ready: max_ready.max(1),
        }
    }

    /// Queue a message for chunking
    pub fn push(&mut self, packet: RtmpPacket) {
        self.pending.push_back(OutgoingMessage::new(packet));
    }

    /// Queue bytes that bypass the chunk layer (handshake responses)
    pub fn push_raw(&mut self, data: Bytes) {
        self.ready.push_back(ReadyChunk::Raw { data });
    }

    /// Messages not yet fully chunked
    pub fn pending_messages(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    /// Chunk pending messages into pool buffers; false if the pool ran dry
    fn fill(&mut self, encoder: &mut ChunkEncoder, pool: &mut BufferPool) -> bool {
        while self.ready.len() < self.max_ready {
            let msg = match self.pending.front_mut() {
                Some(msg) => msg,
                None => return true,
            };
            let mut buf = match pool.acquire() {
                Some(buf) => buf,
                None => return false,
            };
            if encoder.write_chunk(msg, &mut buf) {
                // Later messages use the size this one announces
                if let Some(size) = msg.announced_chunk_size() {
                    encoder.set_chunk_size(size);
                }
                self.pending.pop_front();
            }
            self.ready.push_back(ReadyChunk::Pooled { buf, pos: 0 });
        }
        true
    }

    /// Write as much as the transport accepts
    pub fn flush<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        encoder: &mut ChunkEncoder,
        pool: &mut BufferPool,
    ) -> io::Result<FlushStatus> {
        loop {
            let pool_ok = self.fill(encoder, pool);

            let chunk = match self.ready.front_mut() {
                Some(chunk) => chunk,
                None if pool_ok => return Ok(FlushStatus::Done),
                None => return Ok(FlushStatus::Starved),
            };

            match io.write_nonblocking(chunk.remaining()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    chunk.advance(n);
                    if chunk.remaining().is_empty() {
                        if let Some(ReadyChunk::Pooled { buf, .. }) = self.ready.pop_front() {
                            pool.release(buf);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Blocked)
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return every pooled buffer and drop queued messages
    pub fn release_all(&mut self, pool: &mut BufferPool) {
        self.pending.clear();
        for chunk in self.ready.drain(..) {
            if let ReadyChunk::Pooled { buf, .. } = chunk {
                pool.release(buf);
            }
        }
    }
}
