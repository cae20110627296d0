//! Worker: the protocol engine's unit of execution
//!
//! A worker owns a set of sessions together with the broadcast registry and
//! output buffer pool they share. The reactor feeds it readiness events one
//! at a time: [`Worker::handle_readable`] when a connection has bytes,
//! [`Worker::handle_writable`] when a blocked write can resume, and
//! [`Worker::close`] when the reactor itself gives up on a connection (idle
//! timeout, shutdown). Each call runs to completion without blocking.
//!
//! Every way a session can end funnels through [`Worker::close`], which
//! leaves the registry and returns pooled buffers before the session is
//! dropped.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::protocol::chunk::RtmpPacket;
use crate::protocol::constants::*;
use crate::protocol::message::{Command, RtmpMessage, UserControlEvent};
use crate::registry::{BroadcastRegistry, Departure, Role};
use crate::server::config::EngineConfig;
use crate::server::dispatch::{CommandTable, DispatchContext, SessionEvent};
use crate::server::handler::SessionHandler;
use crate::session::{BufferPool, FlushStatus, Session, SessionId, Transport};

/// Whether a session survived the event just handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Closed,
}

/// Sessions, registry and pool of one worker
pub struct Worker<T, H> {
    sessions: HashMap<SessionId, Session<T>>,
    registry: BroadcastRegistry,
    pool: BufferPool,
    commands: CommandTable,
    config: EngineConfig,
    handler: H,
    next_id: SessionId,
    /// Sessions with freshly queued output
    dirty: HashSet<SessionId>,
    /// Sessions waiting for a pool buffer
    starved: Vec<SessionId>,
}

impl<T: Transport, H: SessionHandler> Worker<T, H> {
    /// Create a worker after validating `config`
    pub fn new(config: EngineConfig, handler: H) -> Result<Self> {
        config.validate()?;
        let pool = BufferPool::new(config.pool_buffers, config.pool_buffer_size());
        Ok(Self {
            sessions: HashMap::new(),
            registry: BroadcastRegistry::new(),
            pool,
            commands: CommandTable::with_defaults(),
            config,
            handler,
            next_id: 1,
            dirty: HashSet::new(),
            starved: Vec::new(),
        })
    }

    /// Replace the command table
    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.commands = commands;
        self
    }

    pub fn commands_mut(&mut self) -> &mut CommandTable {
        &mut self.commands
    }

    pub fn registry(&self) -> &BroadcastRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn session(&self, id: SessionId) -> Option<&Session<T>> {
        self.sessions.get(&id)
    }

    pub fn transport_mut(&mut self, id: SessionId) -> Option<&mut T> {
        self.sessions.get_mut(&id).map(|s| s.transport_mut())
    }

    /// Take ownership of a new connection
    pub fn accept(&mut self, transport: T) -> Result<SessionId> {
        let id = self.next_id;
        self.next_id += 1;

        let mut session = Session::new(id, transport, &self.config);
        session.start()?;
        self.sessions.insert(id, session);

        tracing::debug!(session_id = id, "Session opened");
        self.handler.on_session_opened(id);
        Ok(id)
    }

    /// Consume whatever the session's transport has available
    pub fn handle_readable(&mut self, id: SessionId) -> SessionStatus {
        if !self.sessions.contains_key(&id) {
            return SessionStatus::Closed;
        }

        let status = match self.process_input(id) {
            Ok(true) => SessionStatus::Open,
            Ok(false) => {
                self.close(id);
                SessionStatus::Closed
            }
            Err(e) => {
                match &e {
                    Error::Io(_) | Error::ConnectionClosed => {
                        tracing::debug!(session_id = id, error = %e, "Session I/O failed")
                    }
                    _ => tracing::warn!(session_id = id, error = %e, "Session error"),
                }
                self.close(id);
                SessionStatus::Closed
            }
        };

        self.flush_pending();
        status
    }

    /// Resume output after the transport reported writability
    pub fn handle_writable(&mut self, id: SessionId) -> SessionStatus {
        if !self.sessions.contains_key(&id) {
            return SessionStatus::Closed;
        }
        self.flush_session(id);
        self.flush_pending();

        if self.sessions.contains_key(&id) {
            SessionStatus::Open
        } else {
            SessionStatus::Closed
        }
    }

    /// Close a session; false if it was already gone
    pub fn close(&mut self, id: SessionId) -> bool {
        let mut session = match self.sessions.remove(&id) {
            Some(session) => session,
            None => return false,
        };

        session.release(&mut self.pool);
        self.dirty.remove(&id);
        self.starved.retain(|s| *s != id);

        if let Some(departure) = self.registry.leave(id) {
            self.on_departure(departure);
        }

        tracing::debug!(session_id = id, "Session closed");
        self.handler.on_session_closed(id);
        true
    }

    /// Close every session
    pub fn shutdown(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }

    /// Read, handshake and route packets; `Ok(false)` means close
    fn process_input(&mut self, id: SessionId) -> Result<bool> {
        let out_chunk_size = self.config.out_chunk_size;
        let session = self.sessions.get_mut(&id).ok_or(Error::ConnectionClosed)?;

        let open = session.fill_read_buffer()?;
        let handshake_done = session.drive_handshake(out_chunk_size)?;
        self.mark_dirty(id);
        if !handshake_done {
            return Ok(open);
        }

        loop {
            let session = self.sessions.get_mut(&id).ok_or(Error::ConnectionClosed)?;
            let packet = match session.next_packet()? {
                Some(packet) => packet,
                None => break,
            };
            if !self.route(id, packet)? {
                return Ok(false);
            }
        }
        Ok(open)
    }

    /// Handle one reassembled message; `Ok(false)` means close
    fn route(&mut self, id: SessionId, packet: RtmpPacket) -> Result<bool> {
        match packet.type_id() {
            MSG_SET_CHUNK_SIZE..=MSG_SET_PEER_BANDWIDTH => {
                let msg = RtmpMessage::parse(&packet)?;
                tracing::trace!(session_id = id, message = ?msg, "Control message");
                let session = self.sessions.get_mut(&id).ok_or(Error::ConnectionClosed)?;
                session.handle_control(&msg)?;
                self.mark_dirty(id);
                Ok(true)
            }
            MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3 => match RtmpMessage::parse(&packet) {
                Ok(RtmpMessage::Command(cmd)) | Ok(RtmpMessage::CommandAmf3(cmd)) => {
                    self.dispatch_command(id, &cmd)
                }
                Ok(_) => Ok(true),
                Err(Error::Amf(err)) => {
                    let replies = {
                        let session =
                            self.sessions.get_mut(&id).ok_or(Error::ConnectionClosed)?;
                        let mut ctx = DispatchContext::new(
                            session.state_mut(),
                            &mut self.registry,
                            &self.config,
                        );
                        self.commands
                            .reject_malformed(&mut ctx, packet.header.stream_id, &err);
                        ctx.into_outcome().replies
                    };
                    self.send_replies(id, replies)?;
                    Ok(true)
                }
                Err(e) => Err(e),
            },
            MSG_AUDIO | MSG_VIDEO | MSG_AGGREGATE => {
                self.relay(id, &packet);
                Ok(true)
            }
            type_id => {
                tracing::trace!(session_id = id, type_id = type_id, "Ignoring message");
                Ok(true)
            }
        }
    }

    fn dispatch_command(&mut self, id: SessionId, cmd: &Command) -> Result<bool> {
        let outcome = {
            let session = self.sessions.get_mut(&id).ok_or(Error::ConnectionClosed)?;
            let mut ctx =
                DispatchContext::new(session.state_mut(), &mut self.registry, &self.config);
            self.commands.dispatch(&mut ctx, cmd);
            ctx.into_outcome()
        };

        self.send_replies(id, outcome.replies)?;
        for event in outcome.events {
            self.apply_event(id, event);
        }
        Ok(!outcome.close_requested)
    }

    fn send_replies(&mut self, id: SessionId, replies: Vec<RtmpPacket>) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(Error::ConnectionClosed)?;
        for reply in replies {
            session.send(reply)?;
        }
        self.mark_dirty(id);
        Ok(())
    }

    fn apply_event(&mut self, id: SessionId, event: SessionEvent) {
        match event {
            SessionEvent::Connected(params) => self.handler.on_connect(id, &params),
            SessionEvent::Published { name } => {
                let waiting = self
                    .registry
                    .group(&name)
                    .map(|g| g.subscribers().to_vec())
                    .unwrap_or_default();
                for subscriber in waiting {
                    self.notify_subscriber(
                        subscriber,
                        UserControlEvent::StreamBegin,
                        NS_PLAY_PUBLISH_NOTIFY,
                        &name,
                    );
                }
                self.handler.on_publish(id, &name);
            }
            SessionEvent::Playing { name } => self.handler.on_play(id, &name),
            SessionEvent::Left(departure) => self.on_departure(departure),
        }
    }

    fn on_departure(&mut self, departure: Departure) {
        if departure.role == Role::Publisher {
            for subscriber in &departure.remaining_subscribers {
                self.notify_subscriber(
                    *subscriber,
                    UserControlEvent::StreamEof,
                    NS_PLAY_UNPUBLISH_NOTIFY,
                    &departure.name,
                );
            }
        }
        tracing::debug!(
            session_id = departure.session,
            stream = %departure.name,
            role = ?departure.role,
            "Left broadcast group"
        );
        self.handler.on_leave(&departure);
    }

    /// Tell a subscriber its publisher came or went
    fn notify_subscriber(
        &mut self,
        subscriber: SessionId,
        event: fn(u32) -> UserControlEvent,
        code: &str,
        name: &str,
    ) {
        let stream_id = match self
            .sessions
            .get(&subscriber)
            .and_then(|s| s.state().membership.as_ref())
        {
            Some(membership) => membership.stream_id,
            None => return,
        };

        self.send_to(
            subscriber,
            RtmpMessage::UserControl(event(stream_id)).into_control_packet(),
        );
        let status = Command::on_status(stream_id, 0.0, LEVEL_STATUS, code, name);
        self.send_to(
            subscriber,
            RtmpMessage::Command(status).into_packet(CSID_STREAM_COMMAND, 0, stream_id),
        );
    }

    /// Re-chunk a publisher's media for each subscriber
    fn relay(&mut self, publisher: SessionId, packet: &RtmpPacket) {
        let targets = self.registry.relay_targets(publisher).to_vec();
        if targets.is_empty() {
            return;
        }

        let type_id = packet.type_id();
        let csid = match type_id {
            MSG_AUDIO => CSID_AUDIO,
            MSG_VIDEO => CSID_VIDEO,
            _ => CSID_AGGREGATE,
        };

        for target in targets {
            let stream_id = match self
                .sessions
                .get(&target)
                .and_then(|s| s.state().membership.as_ref())
            {
                Some(m) if m.accepts(type_id) => m.stream_id,
                _ => continue,
            };
            // Payload is shared; only the chunked form is per subscriber
            let out = RtmpPacket::new(
                csid,
                packet.header.timestamp,
                type_id,
                stream_id,
                packet.payload.clone(),
            );
            self.send_to(target, out);
        }
    }

    /// Queue a message for another session, closing it if it cannot keep up
    fn send_to(&mut self, target: SessionId, packet: RtmpPacket) {
        let result = match self.sessions.get_mut(&target) {
            Some(session) => session.send(packet),
            None => return,
        };
        match result {
            Ok(()) => self.mark_dirty(target),
            Err(e) => {
                tracing::warn!(session_id = target, error = %e, "Closing slow session");
                self.close(target);
            }
        }
    }

    fn mark_dirty(&mut self, id: SessionId) {
        self.dirty.insert(id);
    }

    /// Flush dirty sessions, including any dirtied while flushing
    fn drain_dirty(&mut self) {
        while !self.dirty.is_empty() {
            let batch: Vec<SessionId> = self.dirty.drain().collect();
            for id in batch {
                self.flush_session(id);
            }
        }
    }

    fn flush_session(&mut self, id: SessionId) {
        let result = match self.sessions.get_mut(&id) {
            Some(session) => session.flush(&mut self.pool),
            None => return,
        };
        match result {
            Ok(FlushStatus::Starved) => {
                if !self.starved.contains(&id) {
                    self.starved.push(id);
                }
            }
            Ok(FlushStatus::Done) | Ok(FlushStatus::Blocked) => {}
            Err(e) => {
                tracing::debug!(session_id = id, error = %e, "Write failed");
                self.close(id);
            }
        }
    }

    /// Flush every session with new output, then retry the starved ones
    fn flush_pending(&mut self) {
        self.drain_dirty();

        let starved = std::mem::take(&mut self.starved);
        for id in starved {
            self.flush_session(id);
        }

        self.drain_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::AmfValue;
    use crate::server::handler::NoopHandler;
    use crate::testing::{MockTransport, TestClient};

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl SessionHandler for Recorder {
        fn on_connect(&mut self, id: SessionId, params: &crate::protocol::message::ConnectParams) {
            self.events.push(format!("connect {} {}", id, params.app));
        }
        fn on_publish(&mut self, id: SessionId, name: &str) {
            self.events.push(format!("publish {} {}", id, name));
        }
        fn on_play(&mut self, id: SessionId, name: &str) {
            self.events.push(format!("play {} {}", id, name));
        }
        fn on_leave(&mut self, departure: &Departure) {
            self.events.push(format!("leave {} {}", departure.session, departure.name));
        }
        fn on_session_closed(&mut self, id: SessionId) {
            self.events.push(format!("closed {}", id));
        }
    }

    type TestWorker<H> = Worker<MockTransport, H>;

    fn worker<H: SessionHandler>(config: EngineConfig, handler: H) -> TestWorker<H> {
        Worker::new(config, handler).unwrap()
    }

    /// Feed bytes to a session and collect what it wrote back
    fn exchange<H: SessionHandler>(
        w: &mut TestWorker<H>,
        id: SessionId,
        client: &mut TestClient,
        bytes: &[u8],
    ) -> Vec<RtmpMessage> {
        w.transport_mut(id).unwrap().push_inbound(bytes);
        assert_eq!(w.handle_readable(id), SessionStatus::Open);
        let written = w.transport_mut(id).unwrap().take_written();
        client.receive(&written)
    }

    fn handshake<H: SessionHandler>(w: &mut TestWorker<H>, client: &mut TestClient) -> SessionId {
        let id = w.accept(MockTransport::new()).unwrap();
        w.transport_mut(id).unwrap().push_inbound(&client.c0c1());
        w.handle_readable(id);
        let s0s1s2 = w.transport_mut(id).unwrap().take_written();
        let c2 = client.c2(&s0s1s2);
        let replies = exchange(w, id, client, &c2);
        assert_eq!(replies, vec![RtmpMessage::SetChunkSize(w.config().out_chunk_size)]);
        id
    }

    fn status_codes(replies: &[RtmpMessage]) -> Vec<String> {
        replies
            .iter()
            .filter_map(|m| match m {
                RtmpMessage::Command(c) if c.name == CMD_ON_STATUS => {
                    c.arg(0).get_string("code").map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    fn find_command<'a>(replies: &'a [RtmpMessage], name: &str) -> Option<&'a Command> {
        replies.iter().find_map(|m| match m {
            RtmpMessage::Command(c) if c.name == name => Some(c),
            _ => None,
        })
    }

    /// Handshake, connect and createStream; returns the session and stream ids
    fn ready_session<H: SessionHandler>(
        w: &mut TestWorker<H>,
        client: &mut TestClient,
    ) -> (SessionId, u32) {
        let id = handshake(w, client);

        let connect = client.command(
            CMD_CONNECT,
            1.0,
            0,
            AmfValue::object([("app", "live"), ("tcUrl", "rtmp://localhost/live")]),
            vec![],
        );
        let replies = exchange(w, id, client, &connect);
        let result = find_command(&replies, CMD_RESULT).unwrap();
        assert_eq!(result.transaction_id, 1.0);

        let create = client.command(CMD_CREATE_STREAM, 2.0, 0, AmfValue::Null, vec![]);
        let replies = exchange(w, id, client, &create);
        let result = find_command(&replies, CMD_RESULT).unwrap();
        assert_eq!(result.transaction_id, 2.0);
        let stream_id = result.arg(0).as_number().unwrap() as u32;
        assert!(stream_id > 0);

        (id, stream_id)
    }

    #[test]
    fn test_publish_play_relay_scenario() {
        let mut w = worker(EngineConfig::default(), Recorder::default());

        let mut publisher = TestClient::new();
        let (pub_id, pub_stream) = ready_session(&mut w, &mut publisher);
        let publish = publisher.command(
            CMD_PUBLISH,
            3.0,
            pub_stream,
            AmfValue::Null,
            vec!["test".into(), "live".into()],
        );
        let replies = exchange(&mut w, pub_id, &mut publisher, &publish);
        assert_eq!(status_codes(&replies), vec![NS_PUBLISH_START]);

        let mut player = TestClient::new();
        let (play_id, play_stream) = ready_session(&mut w, &mut player);
        let play = player.command(CMD_PLAY, 4.0, play_stream, AmfValue::Null, vec!["test".into()]);
        let replies = exchange(&mut w, play_id, &mut player, &play);
        assert_eq!(status_codes(&replies), vec![NS_PLAY_RESET, NS_PLAY_START]);

        let mut second = TestClient::new();
        let (second_id, second_stream) = ready_session(&mut w, &mut second);
        let play = second.command(CMD_PLAY, 4.0, second_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, second_id, &mut second, &play);
        assert_eq!(w.registry().group("test").unwrap().subscribers(), &[play_id, second_id]);

        let mut media = Vec::new();
        media.extend_from_slice(&publisher.media(MSG_AUDIO, 0, pub_stream, &[0xAF, 1, 2]));
        media.extend_from_slice(&publisher.media(MSG_VIDEO, 0, pub_stream, &[0x17; 300]));
        media.extend_from_slice(&publisher.media(MSG_AUDIO, 23, pub_stream, &[0xAF, 1, 3]));
        let echoed = exchange(&mut w, pub_id, &mut publisher, &media);
        assert!(echoed.is_empty());

        let written = w.transport_mut(play_id).unwrap().take_written();
        let received = player.receive_packets(&written);
        let summary: Vec<(u8, u32, u32, usize)> = received
            .iter()
            .map(|p| (p.type_id(), p.header.timestamp, p.header.stream_id, p.payload.len()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (MSG_AUDIO, 0, play_stream, 3),
                (MSG_VIDEO, 0, play_stream, 300),
                (MSG_AUDIO, 23, play_stream, 3),
            ]
        );
        assert_eq!(&received[2].payload[..], &[0xAF, 1, 3]);

        let written = w.transport_mut(second_id).unwrap().take_written();
        let second_summary: Vec<(u8, u32, usize)> = second
            .receive_packets(&written)
            .iter()
            .map(|p| (p.type_id(), p.header.timestamp, p.payload.len()))
            .collect();
        let first_summary: Vec<(u8, u32, usize)> =
            summary.iter().map(|&(t, ts, _, len)| (t, ts, len)).collect();
        assert_eq!(second_summary, first_summary);

        assert_eq!(
            w.handler().events,
            vec![
                format!("connect {} live", pub_id),
                format!("publish {} test", pub_id),
                format!("connect {} live", play_id),
                format!("play {} test", play_id),
                format!("connect {} live", second_id),
                format!("play {} test", second_id),
            ]
        );
    }

    #[test]
    fn test_second_publisher_rejected() {
        let mut w = worker(EngineConfig::default(), NoopHandler);

        let mut first = TestClient::new();
        let (first_id, first_stream) = ready_session(&mut w, &mut first);
        let publish = first.command(CMD_PUBLISH, 3.0, first_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, first_id, &mut first, &publish);

        let mut second = TestClient::new();
        let (second_id, second_stream) = ready_session(&mut w, &mut second);
        let publish = second.command(CMD_PUBLISH, 3.0, second_stream, AmfValue::Null, vec!["test".into()]);
        let replies = exchange(&mut w, second_id, &mut second, &publish);

        assert_eq!(status_codes(&replies), vec![NS_PUBLISH_BAD_NAME]);
        assert!(w.contains(second_id));
        assert_eq!(w.registry().group("test").unwrap().publisher(), Some(first_id));
    }

    #[test]
    fn test_publisher_disconnect_notifies_subscribers() {
        let mut w = worker(EngineConfig::default(), Recorder::default());

        let mut publisher = TestClient::new();
        let (pub_id, pub_stream) = ready_session(&mut w, &mut publisher);
        let publish = publisher.command(CMD_PUBLISH, 3.0, pub_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, pub_id, &mut publisher, &publish);

        let mut player = TestClient::new();
        let (play_id, play_stream) = ready_session(&mut w, &mut player);
        let play = player.command(CMD_PLAY, 4.0, play_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, play_id, &mut player, &play);

        w.transport_mut(pub_id).unwrap().close_inbound();
        assert_eq!(w.handle_readable(pub_id), SessionStatus::Closed);
        assert!(!w.contains(pub_id));
        assert_eq!(w.registry().group("test").unwrap().publisher(), None);

        let written = w.transport_mut(play_id).unwrap().take_written();
        let replies = player.receive(&written);
        assert_eq!(
            replies[0],
            RtmpMessage::UserControl(UserControlEvent::StreamEof(play_stream))
        );
        assert_eq!(status_codes(&replies), vec![NS_PLAY_UNPUBLISH_NOTIFY]);

        let events = &w.handler().events;
        assert!(events.contains(&format!("leave {} test", pub_id)));
        assert!(events.contains(&format!("closed {}", pub_id)));
    }

    #[test]
    fn test_late_publisher_notifies_waiting_player() {
        let mut w = worker(EngineConfig::default(), NoopHandler);

        let mut player = TestClient::new();
        let (play_id, play_stream) = ready_session(&mut w, &mut player);
        let play = player.command(CMD_PLAY, 4.0, play_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, play_id, &mut player, &play);

        let mut publisher = TestClient::new();
        let (pub_id, pub_stream) = ready_session(&mut w, &mut publisher);
        let publish = publisher.command(CMD_PUBLISH, 3.0, pub_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, pub_id, &mut publisher, &publish);

        let written = w.transport_mut(play_id).unwrap().take_written();
        let replies = player.receive(&written);
        assert_eq!(
            replies[0],
            RtmpMessage::UserControl(UserControlEvent::StreamBegin(play_stream))
        );
        assert_eq!(status_codes(&replies), vec![NS_PLAY_PUBLISH_NOTIFY]);
    }

    #[test]
    fn test_republish_does_not_renotify_players() {
        let mut w = worker(EngineConfig::default(), Recorder::default());

        let mut player = TestClient::new();
        let (play_id, play_stream) = ready_session(&mut w, &mut player);
        let play = player.command(CMD_PLAY, 4.0, play_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, play_id, &mut player, &play);

        let mut publisher = TestClient::new();
        let (pub_id, pub_stream) = ready_session(&mut w, &mut publisher);
        for transaction_id in [3.0, 5.0] {
            let publish = publisher.command(
                CMD_PUBLISH,
                transaction_id,
                pub_stream,
                AmfValue::Null,
                vec!["test".into()],
            );
            let replies = exchange(&mut w, pub_id, &mut publisher, &publish);
            assert_eq!(status_codes(&replies), vec![NS_PUBLISH_START]);
        }

        let written = w.transport_mut(play_id).unwrap().take_written();
        let replies = player.receive(&written);
        assert_eq!(status_codes(&replies), vec![NS_PLAY_PUBLISH_NOTIFY]);
        let begins = replies
            .iter()
            .filter(|m| **m == RtmpMessage::UserControl(UserControlEvent::StreamBegin(play_stream)))
            .count();
        assert_eq!(begins, 1);

        let publishes = w
            .handler()
            .events
            .iter()
            .filter(|e| e.starts_with("publish "))
            .count();
        assert_eq!(publishes, 1);
    }

    #[test]
    fn test_receive_audio_false_filters_relay() {
        let mut w = worker(EngineConfig::default(), NoopHandler);

        let mut publisher = TestClient::new();
        let (pub_id, pub_stream) = ready_session(&mut w, &mut publisher);
        let publish = publisher.command(CMD_PUBLISH, 3.0, pub_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, pub_id, &mut publisher, &publish);

        let mut player = TestClient::new();
        let (play_id, play_stream) = ready_session(&mut w, &mut player);
        let play = player.command(CMD_PLAY, 4.0, play_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, play_id, &mut player, &play);
        let mute = player.command(CMD_RECEIVE_AUDIO, 0.0, play_stream, AmfValue::Null, vec![false.into()]);
        exchange(&mut w, play_id, &mut player, &mute);

        let mut media = Vec::new();
        media.extend_from_slice(&publisher.media(MSG_AUDIO, 0, pub_stream, &[0xAF, 1]));
        media.extend_from_slice(&publisher.media(MSG_VIDEO, 0, pub_stream, &[0x17, 1]));
        exchange(&mut w, pub_id, &mut publisher, &media);

        let written = w.transport_mut(play_id).unwrap().take_written();
        let types: Vec<u8> = player.receive_packets(&written).iter().map(|p| p.type_id()).collect();
        assert_eq!(types, vec![MSG_VIDEO]);
    }

    #[test]
    fn test_slow_subscriber_closed() {
        let config = EngineConfig::default().max_pending_messages(8);
        let mut w = worker(config, Recorder::default());

        let mut publisher = TestClient::new();
        let (pub_id, pub_stream) = ready_session(&mut w, &mut publisher);
        let publish = publisher.command(CMD_PUBLISH, 3.0, pub_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, pub_id, &mut publisher, &publish);

        let mut player = TestClient::new();
        let (play_id, play_stream) = ready_session(&mut w, &mut player);
        let play = player.command(CMD_PLAY, 4.0, play_stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, play_id, &mut player, &play);
        w.transport_mut(play_id).unwrap().set_would_block(true);

        // Large frames fill the subscriber's chunk budget before it can drain
        let mut media = Vec::new();
        for i in 0..64 {
            media.extend_from_slice(&publisher.media(MSG_VIDEO, i * 40, pub_stream, &[0x17; 20_000]));
        }
        exchange(&mut w, pub_id, &mut publisher, &media);

        assert!(w.contains(pub_id));
        assert!(!w.contains(play_id));
        assert!(w.registry().group("test").unwrap().subscribers().is_empty());
        assert!(w.handler().events.contains(&format!("closed {}", play_id)));
    }

    #[test]
    fn test_protocol_error_closes_session() {
        let mut w = worker(EngineConfig::default(), Recorder::default());
        let mut client = TestClient::new();
        let id = handshake(&mut w, &mut client);

        // fmt 3 on a chunk stream that has never been seen
        w.transport_mut(id).unwrap().push_inbound(&[0xC9, 0, 0, 0]);
        assert_eq!(w.handle_readable(id), SessionStatus::Closed);
        assert!(!w.contains(id));
        assert_eq!(w.handler().events, vec![format!("closed {}", id)]);
        assert_eq!(w.pool().outstanding(), 0);
    }

    #[test]
    fn test_bad_handshake_closes_session() {
        let mut w = worker(EngineConfig::default(), NoopHandler);
        let id = w.accept(MockTransport::new()).unwrap();
        let mut bad = vec![0u8; 1 + HANDSHAKE_SIZE];
        bad[0] = 2;
        w.transport_mut(id).unwrap().push_inbound(&bad);
        assert_eq!(w.handle_readable(id), SessionStatus::Closed);
        assert_eq!(w.session_count(), 0);
    }

    #[test]
    fn test_malformed_command_keeps_session() {
        let mut w = worker(EngineConfig::default(), NoopHandler);
        let mut client = TestClient::new();
        let id = handshake(&mut w, &mut client);

        // Command name marker claims a string longer than the payload
        let bad = client.raw_message(MSG_COMMAND_AMF0, 0, &[0x02, 0x00, 0x20, b'c']);
        let replies = exchange(&mut w, id, &mut client, &bad);
        let error = find_command(&replies, CMD_ERROR).unwrap();
        assert_eq!(error.arg(0).get_string("code"), Some(NC_CALL_BAD_VALUE));
        assert!(w.contains(id));
    }

    #[test]
    fn test_close_command_closes_session() {
        let mut w = worker(EngineConfig::default(), NoopHandler);
        let mut client = TestClient::new();
        let (id, _) = ready_session(&mut w, &mut client);

        let close = client.command(CMD_CLOSE, 0.0, 0, AmfValue::Null, vec![]);
        w.transport_mut(id).unwrap().push_inbound(&close);
        assert_eq!(w.handle_readable(id), SessionStatus::Closed);
        assert!(!w.close(id));
    }

    #[test]
    fn test_ping_answered() {
        let mut w = worker(EngineConfig::default(), NoopHandler);
        let mut client = TestClient::new();
        let id = handshake(&mut w, &mut client);

        let ping = client.control(RtmpMessage::UserControl(UserControlEvent::PingRequest(1234)));
        let replies = exchange(&mut w, id, &mut client, &ping);
        assert_eq!(
            replies,
            vec![RtmpMessage::UserControl(UserControlEvent::PingResponse(1234))]
        );
    }

    #[test]
    fn test_blocked_output_resumes_on_writable() {
        let mut w = worker(EngineConfig::default(), NoopHandler);
        let mut client = TestClient::new();
        let id = handshake(&mut w, &mut client);
        w.transport_mut(id).unwrap().set_would_block(true);

        let connect = client.command(CMD_CONNECT, 1.0, 0, AmfValue::object([("app", "live")]), vec![]);
        w.transport_mut(id).unwrap().push_inbound(&connect);
        w.handle_readable(id);
        assert!(w.transport_mut(id).unwrap().take_written().is_empty());
        assert!(w.session(id).unwrap().has_pending_output());

        w.transport_mut(id).unwrap().set_would_block(false);
        assert_eq!(w.handle_writable(id), SessionStatus::Open);
        let written = w.transport_mut(id).unwrap().take_written();
        let replies = client.receive(&written);
        assert!(find_command(&replies, CMD_RESULT).is_some());
        assert!(!w.session(id).unwrap().has_pending_output());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut w = worker(EngineConfig::default(), NoopHandler);
        let mut client = TestClient::new();
        let (id, stream) = ready_session(&mut w, &mut client);
        let publish = client.command(CMD_PUBLISH, 3.0, stream, AmfValue::Null, vec!["test".into()]);
        exchange(&mut w, id, &mut client, &publish);

        w.shutdown();
        assert_eq!(w.session_count(), 0);
        assert!(w.registry().is_empty());
        assert_eq!(w.pool().outstanding(), 0);
    }
}
