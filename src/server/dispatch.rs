//! Command dispatcher
//!
//! Commands are looked up by name in a [`CommandTable`] populated at startup.
//! Each handler validates its arguments, performs any registry operation and
//! queues replies carrying the command's transaction id. A handler failure is
//! a [`CommandError`]: it becomes an `_error` (NetConnection commands) or an
//! error `onStatus` (NetStream commands) and the session stays open.

use std::collections::HashMap;
use std::fmt;

use crate::amf::AmfValue;
use crate::error::AmfError;
use crate::protocol::chunk::RtmpPacket;
use crate::protocol::constants::*;
use crate::protocol::message::{status_info, Command, ConnectParams, RtmpMessage, UserControlEvent};
use crate::registry::{BroadcastRegistry, Departure, RegistryError, Role};
use crate::server::config::EngineConfig;
use crate::session::{SessionState, StreamMembership};

/// Recoverable command failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    /// Status code sent to the peer
    pub code: &'static str,
    pub description: String,
}

impl CommandError {
    pub fn new(code: &'static str, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

impl std::error::Error for CommandError {}

impl From<RegistryError> for CommandError {
    fn from(err: RegistryError) -> Self {
        CommandError::new(NS_PUBLISH_BAD_NAME, err.to_string())
    }
}

/// Something the worker must act on after a command ran
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected(ConnectParams),
    Published { name: String },
    Playing { name: String },
    /// The session left a group; remaining subscribers may need notifying
    Left(Departure),
}

/// What dispatching produced for the worker to apply
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Messages for the dispatched session, in order
    pub replies: Vec<RtmpPacket>,
    pub events: Vec<SessionEvent>,
    /// `close` was received
    pub close_requested: bool,
}

/// Everything a command handler may touch
pub struct DispatchContext<'a> {
    pub session: &'a mut SessionState,
    pub registry: &'a mut BroadcastRegistry,
    pub config: &'a EngineConfig,
    outcome: DispatchOutcome,
}

impl<'a> DispatchContext<'a> {
    pub fn new(
        session: &'a mut SessionState,
        registry: &'a mut BroadcastRegistry,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            session,
            registry,
            config,
            outcome: DispatchOutcome::default(),
        }
    }

    /// Queue a command reply on the chunk stream matching its message stream
    pub fn reply_command(&mut self, cmd: Command) {
        let csid = if cmd.stream_id == 0 {
            CSID_COMMAND
        } else {
            CSID_STREAM_COMMAND
        };
        let stream_id = cmd.stream_id;
        self.outcome
            .replies
            .push(RtmpMessage::Command(cmd).into_packet(csid, 0, stream_id));
    }

    /// Queue a protocol or user control message
    pub fn reply_control(&mut self, msg: RtmpMessage) {
        self.outcome.replies.push(msg.into_control_packet());
    }

    pub fn reply_status(&mut self, stream_id: u32, transaction_id: f64, code: &str, description: &str) {
        self.reply_command(Command::on_status(
            stream_id,
            transaction_id,
            LEVEL_STATUS,
            code,
            description,
        ));
    }

    /// Answer a failed command
    pub fn reply_error(&mut self, cmd: &Command, err: &CommandError) {
        if cmd.stream_id == 0 {
            self.reply_command(Command::error(
                cmd.transaction_id,
                AmfValue::Null,
                status_info(LEVEL_ERROR, err.code, &err.description),
            ));
        } else {
            self.reply_command(Command::on_status(
                cmd.stream_id,
                cmd.transaction_id,
                LEVEL_ERROR,
                err.code,
                &err.description,
            ));
        }
    }

    /// Leave the current broadcast group, if any
    pub fn leave_group(&mut self) -> Option<Role> {
        self.session.membership = None;
        let departure = self.registry.leave(self.session.id)?;
        let role = departure.role;
        self.outcome.events.push(SessionEvent::Left(departure));
        Some(role)
    }

    /// Join a group and record the membership
    fn join_group(&mut self, name: &str, role: Role, stream_id: u32) -> Result<(), CommandError> {
        if let Some(previous) = self.registry.join(self.session.id, name, role)? {
            self.outcome.events.push(SessionEvent::Left(previous));
        }
        self.session.membership = Some(StreamMembership::new(name, role, stream_id));
        Ok(())
    }

    fn push_event(&mut self, event: SessionEvent) {
        self.outcome.events.push(event);
    }

    pub fn request_close(&mut self) {
        self.outcome.close_requested = true;
    }

    pub fn into_outcome(self) -> DispatchOutcome {
        self.outcome
    }
}

/// Signature shared by every command handler
pub type CommandHandler = fn(&mut DispatchContext<'_>, &Command) -> Result<(), CommandError>;

/// Command name to handler mapping
pub struct CommandTable {
    handlers: HashMap<&'static str, CommandHandler>,
}

impl CommandTable {
    /// An empty table
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The standard NetConnection and NetStream commands
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(CMD_CONNECT, connect);
        table.register(CMD_CALL, call);
        table.register(CMD_CLOSE, close);
        table.register(CMD_CREATE_STREAM, create_stream);
        table.register(CMD_PLAY, play);
        table.register(CMD_PLAY2, play2);
        table.register(CMD_DELETE_STREAM, delete_stream);
        table.register(CMD_CLOSE_STREAM, close_stream);
        table.register(CMD_RECEIVE_AUDIO, receive_audio);
        table.register(CMD_RECEIVE_VIDEO, receive_video);
        table.register(CMD_PUBLISH, publish);
        table.register(CMD_SEEK, seek);
        table.register(CMD_PAUSE, pause);
        table.register(CMD_RELEASE_STREAM, release_stream);
        table.register(CMD_FC_PUBLISH, fc_publish);
        table.register(CMD_FC_UNPUBLISH, fc_unpublish);
        table
    }

    /// Add or replace a handler
    pub fn register(&mut self, name: &'static str, handler: CommandHandler) {
        self.handlers.insert(name, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run the handler for `cmd`, answering failures and unknown names
    pub fn dispatch(&self, ctx: &mut DispatchContext<'_>, cmd: &Command) {
        tracing::trace!(
            session_id = ctx.session.id,
            command = %cmd.name,
            transaction_id = cmd.transaction_id,
            stream_id = cmd.stream_id,
            "Command"
        );

        let handler = match self.handlers.get(cmd.name.as_str()) {
            Some(handler) => *handler,
            None => {
                tracing::debug!(session_id = ctx.session.id, command = %cmd.name, "Ignoring unknown command");
                ctx.reply_status(
                    cmd.stream_id,
                    cmd.transaction_id,
                    NC_CALL_IGNORED,
                    &format!("Command {} ignored", cmd.name),
                );
                return;
            }
        };

        if !ctx.session.connected && cmd.name != CMD_CONNECT {
            let err = CommandError::new(NC_CALL_FAILED, "connect must come first");
            ctx.reply_error(cmd, &err);
            return;
        }

        if let Err(err) = handler(ctx, cmd) {
            tracing::debug!(
                session_id = ctx.session.id,
                command = %cmd.name,
                error = %err,
                "Command failed"
            );
            ctx.reply_error(cmd, &err);
        }
    }

    /// Answer a command whose body could not be decoded
    pub fn reject_malformed(&self, ctx: &mut DispatchContext<'_>, stream_id: u32, err: &AmfError) {
        tracing::debug!(session_id = ctx.session.id, error = %err, "Malformed command");
        let cmd = Command {
            name: String::new(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: Vec::new(),
            stream_id,
        };
        ctx.reply_error(&cmd, &CommandError::new(NC_CALL_BAD_VALUE, err.to_string()));
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Stream name argument with any query string removed
fn stream_name(value: &AmfValue) -> Option<String> {
    let raw = value.as_str()?;
    let name = raw.split('?').next().unwrap_or(raw).trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn require_stream(ctx: &DispatchContext<'_>, stream_id: u32) -> Result<(), CommandError> {
    if stream_id == 0 || !ctx.session.has_stream(stream_id) {
        return Err(CommandError::new(
            NS_FAILED,
            format!("Stream {} was not created", stream_id),
        ));
    }
    Ok(())
}

fn connect(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    if ctx.session.connected {
        return Err(CommandError::new(NC_CONNECT_FAILED, "Already connected"));
    }
    if cmd.command_object.as_object().is_none() {
        return Err(CommandError::new(
            NC_CONNECT_FAILED,
            "connect requires a command object",
        ));
    }

    let params = ConnectParams::from_amf(&cmd.command_object);
    ctx.session.connected = true;
    ctx.session.app = params.app.clone();

    ctx.reply_control(RtmpMessage::WindowAckSize(ctx.config.window_ack_size));
    ctx.reply_control(RtmpMessage::SetPeerBandwidth {
        size: ctx.config.peer_bandwidth,
        limit_type: BANDWIDTH_LIMIT_DYNAMIC,
    });
    ctx.reply_control(RtmpMessage::UserControl(UserControlEvent::StreamBegin(0)));

    let properties = AmfValue::object([
        ("fmsVer", AmfValue::from("FMS/3,5,7,7009")),
        ("capabilities", AmfValue::from(31.0)),
        ("mode", AmfValue::from(1.0)),
    ]);
    let mut info = status_info(LEVEL_STATUS, NC_CONNECT_SUCCESS, "Connection succeeded.");
    if let AmfValue::Object(props) = &mut info {
        props.push(("objectEncoding".into(), params.object_encoding.into()));
    }
    ctx.reply_command(Command::result(cmd.transaction_id, properties, info));

    tracing::info!(session_id = ctx.session.id, app = %params.app, "Connected");
    ctx.push_event(SessionEvent::Connected(params));
    Ok(())
}

fn call(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    if cmd.transaction_id != 0.0 {
        ctx.reply_command(Command::result(
            cmd.transaction_id,
            AmfValue::Null,
            AmfValue::Null,
        ));
    }
    Ok(())
}

fn close(ctx: &mut DispatchContext<'_>, _cmd: &Command) -> Result<(), CommandError> {
    ctx.leave_group();
    ctx.request_close();
    Ok(())
}

fn create_stream(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let stream_id = ctx
        .session
        .allocate_stream(ctx.config.max_message_streams)
        .ok_or_else(|| CommandError::new(NC_CALL_FAILED, "Too many streams"))?;

    ctx.reply_command(Command::result(
        cmd.transaction_id,
        AmfValue::Null,
        AmfValue::from(stream_id),
    ));

    tracing::debug!(session_id = ctx.session.id, stream_id = stream_id, "Stream created");
    Ok(())
}

fn delete_stream(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let stream_id = cmd
        .arg(0)
        .as_number()
        .ok_or_else(|| CommandError::new(NC_CALL_BAD_VALUE, "deleteStream requires a stream id"))?
        as u32;

    let joined_here = ctx
        .session
        .membership
        .as_ref()
        .map(|m| m.stream_id == stream_id)
        .unwrap_or(false);
    if joined_here {
        ctx.leave_group();
    }
    ctx.session.release_stream(stream_id);

    tracing::debug!(session_id = ctx.session.id, stream_id = stream_id, "Stream deleted");
    Ok(())
}

fn close_stream(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let joined_here = ctx
        .session
        .membership
        .as_ref()
        .map(|m| m.stream_id == cmd.stream_id)
        .unwrap_or(false);
    if !joined_here {
        return Ok(());
    }

    match ctx.leave_group() {
        Some(Role::Publisher) => ctx.reply_status(
            cmd.stream_id,
            cmd.transaction_id,
            NS_UNPUBLISH_SUCCESS,
            "Stream unpublished",
        ),
        Some(Role::Subscriber) => ctx.reply_status(
            cmd.stream_id,
            cmd.transaction_id,
            NS_PLAY_STOP,
            "Stopped playing",
        ),
        None => {}
    }
    Ok(())
}

fn publish(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let name = stream_name(cmd.arg(0)).ok_or_else(|| {
        CommandError::new(NS_PUBLISH_BAD_NAME, "publish requires a stream name")
    })?;
    require_stream(ctx, cmd.stream_id)?;

    // Waiting players were already told about this publisher
    let republish = ctx
        .session
        .membership
        .as_ref()
        .map_or(false, |m| m.role == Role::Publisher && m.name == name);

    if let Err(err) = ctx.join_group(&name, Role::Publisher, cmd.stream_id) {
        tracing::warn!(
            session_id = ctx.session.id,
            stream = %name,
            error = %err,
            "Publish rejected"
        );
        return Err(err);
    }

    ctx.reply_control(RtmpMessage::UserControl(UserControlEvent::StreamBegin(
        cmd.stream_id,
    )));
    ctx.reply_status(
        cmd.stream_id,
        cmd.transaction_id,
        NS_PUBLISH_START,
        &format!("{} is now published", name),
    );

    if !republish {
        tracing::info!(session_id = ctx.session.id, stream = %name, "Publishing started");
        ctx.push_event(SessionEvent::Published { name });
    }
    Ok(())
}

fn start_playing(
    ctx: &mut DispatchContext<'_>,
    cmd: &Command,
    name: String,
    reset: bool,
) -> Result<(), CommandError> {
    ctx.join_group(&name, Role::Subscriber, cmd.stream_id)?;

    ctx.reply_control(RtmpMessage::UserControl(UserControlEvent::StreamBegin(
        cmd.stream_id,
    )));
    if reset {
        ctx.reply_status(
            cmd.stream_id,
            cmd.transaction_id,
            NS_PLAY_RESET,
            &format!("Playing and resetting {}", name),
        );
    }
    ctx.reply_status(
        cmd.stream_id,
        cmd.transaction_id,
        NS_PLAY_START,
        &format!("Started playing {}", name),
    );

    tracing::info!(session_id = ctx.session.id, stream = %name, "Playing started");
    ctx.push_event(SessionEvent::Playing { name });
    Ok(())
}

fn play(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let name = stream_name(cmd.arg(0))
        .ok_or_else(|| CommandError::new(NS_PLAY_FAILED, "play requires a stream name"))?;
    require_stream(ctx, cmd.stream_id)?;

    // play(name, start, duration, reset)
    let reset = cmd.arg(3).as_bool().unwrap_or(true);
    start_playing(ctx, cmd, name, reset)
}

fn play2(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let name = cmd
        .arg(0)
        .get("streamName")
        .and_then(stream_name)
        .ok_or_else(|| CommandError::new(NC_CALL_BAD_VALUE, "play2 requires streamName"))?;
    require_stream(ctx, cmd.stream_id)?;

    let switching = ctx.session.membership.is_some();
    if !switching {
        return start_playing(ctx, cmd, name, true);
    }

    ctx.join_group(&name, Role::Subscriber, cmd.stream_id)?;
    ctx.reply_status(
        cmd.stream_id,
        cmd.transaction_id,
        NS_PLAY_TRANSITION,
        &format!("Transitioning to {}", name),
    );
    ctx.push_event(SessionEvent::Playing { name });
    Ok(())
}

fn subscriber_mut<'c>(
    ctx: &'c mut DispatchContext<'_>,
) -> Result<&'c mut StreamMembership, CommandError> {
    match ctx.session.membership.as_mut() {
        Some(m) if m.role == Role::Subscriber => Ok(m),
        _ => Err(CommandError::new(NS_FAILED, "Not playing")),
    }
}

fn receive_flag(cmd: &Command) -> Result<bool, CommandError> {
    cmd.arg(0).as_bool().ok_or_else(|| {
        CommandError::new(NC_CALL_BAD_VALUE, format!("{} requires a boolean", cmd.name))
    })
}

fn receive_audio(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let flag = receive_flag(cmd)?;
    subscriber_mut(ctx)?.receive_audio = flag;
    Ok(())
}

fn receive_video(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let flag = receive_flag(cmd)?;
    subscriber_mut(ctx)?.receive_video = flag;
    Ok(())
}

fn seek(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let offset = cmd.arg(0).as_number().unwrap_or(0.0);
    subscriber_mut(ctx)?;

    // Live streams have nothing to seek into; acknowledge and keep relaying
    ctx.reply_status(
        cmd.stream_id,
        cmd.transaction_id,
        NS_SEEK_NOTIFY,
        &format!("Seeking {} (stream is live)", offset),
    );
    Ok(())
}

fn pause(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let paused = cmd
        .arg(0)
        .as_bool()
        .ok_or_else(|| CommandError::new(NC_CALL_BAD_VALUE, "pause requires a boolean"))?;

    let membership = subscriber_mut(ctx)?;
    membership.paused = paused;
    let stream_id = membership.stream_id;

    if paused {
        ctx.reply_control(RtmpMessage::UserControl(UserControlEvent::StreamEof(stream_id)));
        ctx.reply_status(stream_id, cmd.transaction_id, NS_PAUSE_NOTIFY, "Paused");
    } else {
        ctx.reply_control(RtmpMessage::UserControl(UserControlEvent::StreamBegin(
            stream_id,
        )));
        ctx.reply_status(stream_id, cmd.transaction_id, NS_UNPAUSE_NOTIFY, "Unpaused");
    }
    Ok(())
}

fn release_stream(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    if cmd.transaction_id != 0.0 {
        ctx.reply_command(Command::result(
            cmd.transaction_id,
            AmfValue::Null,
            AmfValue::Undefined,
        ));
    }
    Ok(())
}

fn fc_publish(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let name = cmd.arg(0).as_str().unwrap_or("");
    ctx.reply_command(Command::notify(
        CMD_ON_FC_PUBLISH,
        0,
        status_info(LEVEL_STATUS, NS_PUBLISH_START, &format!("FCPublish to stream {}", name)),
    ));
    Ok(())
}

fn fc_unpublish(ctx: &mut DispatchContext<'_>, cmd: &Command) -> Result<(), CommandError> {
    let name = cmd.arg(0).as_str().unwrap_or("");
    ctx.reply_command(Command::notify(
        CMD_ON_FC_UNPUBLISH,
        0,
        status_info(
            LEVEL_STATUS,
            NS_UNPUBLISH_SUCCESS,
            &format!("FCUnpublish from stream {}", name),
        ),
    ));
    Ok(())
}
