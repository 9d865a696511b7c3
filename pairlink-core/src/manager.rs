//! Host-driven API: PeerSessionManager receives link, session and UI events from the host,
//! returns actions for the host to perform.
//!
//! The manager owns the link state, the request table, the log pull slot and the external
//! session bridge. It is `&mut self` only; the host must call it from one sequencing context.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, error, info, warn};

use crate::error::{LinkError, LogPullError, ProtocolError};
use crate::link::{ActivationState, LinkEvent, LinkStateMachine, LinkStatus};
use crate::message::{Command, MessageKind, PeerMessage, ATTEMPT, LOG_TRANSFER_TYPE, SUCCESS};
use crate::pending::{
    ErrorCallback, LogPullCallback, LogPullSlot, PendingLogPull, PendingRequest, ReplyCallback,
    ReplyShape, RequestTable,
};
use crate::session::{
    Convergence, SessionBridge, SessionConfig, SessionError, SessionId, SessionSource,
    SessionState,
};
use crate::sink::LogSink;

/// Default log pull deadline in ticks.
pub const DEFAULT_LOG_PULL_DEADLINE_TICKS: u64 = 20;

/// Default reply timeout for reply-expecting sends in ticks.
pub const DEFAULT_REQUEST_TIMEOUT_TICKS: u64 = 10;

/// Which side of the pair this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Phone,
    Watch,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Phone => "phone",
            Role::Watch => "watch",
        }
    }

    /// Prefix for relays originating here.
    pub fn relay_prefix(&self) -> &'static str {
        match self {
            Role::Phone => "from phone",
            Role::Watch => "from Watch",
        }
    }

    /// Acknowledgment text for relays received here.
    pub fn ack_text(&self) -> &'static str {
        match self {
            Role::Phone => "iPhone received",
            Role::Watch => "Watch received",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role `{0}` (expected phone or watch)")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "phone" => Ok(Role::Phone),
            "watch" => Ok(Role::Watch),
            _ => Err(UnknownRole(s.to_owned())),
        }
    }
}

/// How a reply with the wrong shape is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolMode {
    /// Fail the request with `LinkError::Protocol` and keep running.
    #[default]
    Lenient,
    /// Panic. A malformed reply never happens in a well-formed deployment.
    Strict,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub request_timeout_ticks: u64,
    pub log_pull_deadline_ticks: u64,
    pub protocol_mode: ProtocolMode,
    /// Phone side: pull logs every time the link becomes activated.
    pub prime_log_pull: bool,
    pub session: SessionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ticks: DEFAULT_REQUEST_TIMEOUT_TICKS,
            log_pull_deadline_ticks: DEFAULT_LOG_PULL_DEADLINE_TICKS,
            protocol_mode: ProtocolMode::default(),
            prime_log_pull: false,
            session: SessionConfig::default(),
        }
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Ask the transport to (re)activate the link.
    Activate,
    /// Hand a message to the transport. The host reports back with `on_send_delivered`,
    /// `on_send_failed` or `on_reply_received` using `id`.
    Send {
        id: u64,
        message: PeerMessage,
        expects_reply: bool,
    },
    TransferFile {
        path: PathBuf,
        metadata: PeerMessage,
    },
    /// Relay payload for the UI observer. Host marshals onto the UI context.
    Deliver(String),
    /// A bulk file that no pending request claimed.
    FileReceived {
        path: PathBuf,
        metadata: PeerMessage,
    },
}

/// Result of handling an inbound message.
#[derive(Debug, Default)]
pub struct Received {
    /// Reply for the transport to return; always `Some` when the sender expects one.
    pub reply: Option<PeerMessage>,
    pub actions: Vec<OutboundAction>,
}

/// Main coordinator. Host passes events; manager returns actions.
pub struct PeerSessionManager {
    role: Role,
    config: ManagerConfig,
    link: LinkStateMachine,
    activation_requested: bool,
    requests: RequestTable,
    log_pull: LogPullSlot,
    next_request_id: u64,
    tick_count: u64,
    startup_attempts: u64,
    startup_notice_pending: bool,
    peer_startups: u64,
    bridge: SessionBridge,
    log_sink: Box<dyn LogSink>,
}

impl PeerSessionManager {
    pub fn new(
        role: Role,
        config: ManagerConfig,
        log_sink: Box<dyn LogSink>,
        session_source: Box<dyn SessionSource>,
    ) -> Self {
        let bridge = SessionBridge::new(session_source, config.session.clone());
        Self {
            role,
            config,
            link: LinkStateMachine::new(),
            activation_requested: false,
            requests: RequestTable::new(),
            log_pull: LogPullSlot::new(),
            next_request_id: 1,
            tick_count: 0,
            startup_attempts: 0,
            startup_notice_pending: false,
            peer_startups: 0,
            bridge,
            log_sink,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> LinkStatus {
        self.link.status()
    }

    pub fn session_state(&self) -> SessionState {
        self.bridge.state()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.bridge.session_id()
    }

    pub fn startup_attempts(&self) -> u64 {
        self.startup_attempts
    }

    /// `setStartingUp` notices received from the peer.
    pub fn peer_startups(&self) -> u64 {
        self.peer_startups
    }

    pub fn has_pending_log_pull(&self) -> bool {
        self.log_pull.is_armed()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    // ---- link lifecycle ----

    /// Request link activation. `supported` is the transport's capability check; `false` is
    /// returned as `LinkError::Unsupported` and the host must not continue.
    pub fn activate(&mut self, supported: bool) -> Result<Vec<OutboundAction>, LinkError> {
        if !supported {
            error!(role = %self.role, "link not supported on this device");
            return Err(LinkError::Unsupported);
        }
        if self.activation_requested {
            debug!("activation already requested");
            return Ok(vec![]);
        }
        self.activation_requested = true;
        info!(role = %self.role, "activating link");
        Ok(vec![OutboundAction::Activate])
    }

    pub fn on_activation_complete(
        &mut self,
        state: ActivationState,
        error: Option<String>,
    ) -> Vec<OutboundAction> {
        self.on_link_event(LinkEvent::ActivationCompleted { state, error })
    }

    pub fn on_reachability_changed(&mut self, reachable: bool) -> Vec<OutboundAction> {
        self.on_link_event(LinkEvent::ReachabilityChanged(reachable))
    }

    pub fn on_peer_installed_changed(&mut self, installed: bool) -> Vec<OutboundAction> {
        self.on_link_event(LinkEvent::PeerInstalledChanged(installed))
    }

    pub fn on_session_inactive(&mut self) -> Vec<OutboundAction> {
        self.on_link_event(LinkEvent::BecameInactive)
    }

    pub fn on_session_deactivated(&mut self) -> Vec<OutboundAction> {
        self.on_link_event(LinkEvent::Deactivated)
    }

    pub fn on_link_event(&mut self, event: LinkEvent) -> Vec<OutboundAction> {
        let deactivated = event == LinkEvent::Deactivated;
        let t = self.link.apply(event);
        let mut actions = Vec::new();
        if deactivated {
            self.fail_all_pending();
        }
        if t.reactivate {
            self.activation_requested = true;
            actions.push(OutboundAction::Activate);
        }
        if t.entered_activated {
            actions.extend(self.on_entered_activated());
        }
        if t.reachability_changed && self.link.is_reachable() {
            actions.extend(self.send_log_pull_command());
        }
        actions
    }

    fn on_entered_activated(&mut self) -> Vec<OutboundAction> {
        match self.role {
            Role::Watch => self.start_external_session(),
            Role::Phone if self.config.prime_log_pull => {
                let deadline = self.config.log_pull_deadline_ticks;
                self.pull_logs(
                    deadline,
                    Box::new(|result: Result<PathBuf, LogPullError>| match result {
                        Ok(path) => info!(path = %path.display(), "primed log pull received bundle"),
                        Err(e) => info!(error = %e, "primed log pull finished without bundle"),
                    }),
                )
            }
            Role::Phone => vec![],
        }
    }

    /// Deactivation fails everything in flight, the log pull first.
    fn fail_all_pending(&mut self) {
        if let Some(pull) = self.log_pull.take() {
            warn!(id = pull.request_id, "log pull abandoned by deactivation");
            pull.complete(Err(LogPullError::Deactivated));
        }
        for (id, request) in self.requests.drain() {
            warn!(id, "request abandoned by deactivation");
            request.fail(LinkError::Deactivated);
        }
    }

    // ---- outbound ----

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Send a message. Unreachable peer short-circuits: nothing is sent and neither callback
    /// fires. `on_reply: Some(..)` makes this a reply-expecting request with a deadline.
    pub fn send(
        &mut self,
        message: PeerMessage,
        on_reply: Option<ReplyCallback>,
        on_error: ErrorCallback,
    ) -> Vec<OutboundAction> {
        if !self.link.is_reachable() {
            warn!(%message, "send: peer not reachable, dropping");
            return vec![];
        }
        let id = self.alloc_id();
        let expects_reply = on_reply.is_some();
        let shape = ReplyShape::for_request(&message);
        debug!(id, %message, expects_reply, "send");
        self.requests.insert(
            id,
            PendingRequest::new(
                self.tick_count,
                self.config.request_timeout_ticks,
                shape,
                on_reply,
                on_error,
            ),
        );
        vec![OutboundAction::Send {
            id,
            message,
            expects_reply,
        }]
    }

    /// Send `"<role prefix>: text"` as a plain relay.
    pub fn send_relay(
        &mut self,
        text: &str,
        on_reply: Option<ReplyCallback>,
        on_error: ErrorCallback,
    ) -> Vec<OutboundAction> {
        let message = PeerMessage::relay(format!("{}: {}", self.role.relay_prefix(), text));
        self.send(message, on_reply, on_error)
    }

    /// Transport accepted a message. Fire-and-forget entries are done.
    pub fn on_send_delivered(&mut self, id: u64) {
        let done = self.requests.get(id).is_some_and(|r| !r.expects_reply());
        if done {
            self.requests.take(id);
            debug!(id, "delivered");
        }
    }

    pub fn on_send_failed(&mut self, id: u64, reason: String) {
        if let Some(pull) = self.log_pull.take_for_request(id) {
            warn!(id, %reason, "getLogs send failed");
            pull.complete(Err(LogPullError::Transport(reason)));
            return;
        }
        match self.requests.take(id) {
            Some(request) => {
                warn!(id, %reason, "send failed");
                request.fail(LinkError::Transport(reason));
            }
            None => debug!(id, %reason, "failure for unknown or resolved request"),
        }
    }

    /// Reply from the peer for request `id`. Shape mismatches fail the request; in strict mode
    /// they panic.
    pub fn on_reply_received(&mut self, id: u64, reply: PeerMessage) -> Result<(), ProtocolError> {
        if self.log_pull.request_id() == Some(id) {
            return self.on_log_pull_reply(id, reply);
        }
        let Some(request) = self.requests.take(id) else {
            debug!(id, %reply, "reply for unknown or resolved request");
            return Ok(());
        };
        match request.shape.check(&reply) {
            Ok(()) => {
                debug!(id, %reply, "reply received");
                request.resolve(reply);
                Ok(())
            }
            Err(e) => {
                self.protocol_violation(id, &reply, &e);
                request.fail(LinkError::Protocol(e.clone()));
                Err(e)
            }
        }
    }

    fn on_log_pull_reply(&mut self, id: u64, reply: PeerMessage) -> Result<(), ProtocolError> {
        if let Err(e) = ReplyShape::CommandResult.check(&reply) {
            self.protocol_violation(id, &reply, &e);
            if let Some(pull) = self.log_pull.take_for_request(id) {
                pull.complete(Err(LogPullError::Protocol(e.clone())));
            }
            return Err(e);
        }
        if reply.get_bool(SUCCESS) == Some(true) {
            info!(id, "peer accepted getLogs, waiting for transfer");
        } else if let Some(pull) = self.log_pull.take_for_request(id) {
            warn!(id, "peer has no log bundle");
            pull.complete(Err(LogPullError::Unavailable));
        }
        Ok(())
    }

    fn protocol_violation(&self, id: u64, reply: &PeerMessage, e: &ProtocolError) {
        error!(id, %reply, error = %e, "wrong reply format");
        if self.config.protocol_mode == ProtocolMode::Strict {
            panic!("protocol violation on request {}: {}", id, e);
        }
    }

    // ---- inbound ----

    /// Message from the peer. When `expects_reply` is set the returned `reply` is always
    /// `Some` and must be handed back to the transport before anything else.
    pub fn on_message_received(&mut self, message: PeerMessage, expects_reply: bool) -> Received {
        info!(%message, expects_reply, "message received");
        let mut out = Received::default();
        match message.kind() {
            MessageKind::Relay(text) => {
                out.actions.push(OutboundAction::Deliver(text.to_owned()));
                if expects_reply {
                    out.reply = Some(PeerMessage::relay(self.role.ack_text()));
                }
            }
            MessageKind::Command(cmd) => {
                let ok = self.run_command(&cmd, &message, &mut out.actions);
                if expects_reply {
                    out.reply = Some(PeerMessage::success(ok));
                }
            }
            MessageKind::Reply(_) | MessageKind::Unknown => {
                warn!(%message, "unexpected message payload");
                if expects_reply {
                    out.reply = Some(PeerMessage::success(false));
                }
            }
        }
        out
    }

    fn run_command(
        &mut self,
        cmd: &Command,
        message: &PeerMessage,
        actions: &mut Vec<OutboundAction>,
    ) -> bool {
        match cmd {
            Command::GetLogs => match self.log_sink.produce_bundle() {
                Some(path) => {
                    info!(path = %path.display(), "sending log bundle");
                    actions.push(OutboundAction::TransferFile {
                        path,
                        metadata: PeerMessage::file_metadata(LOG_TRANSFER_TYPE),
                    });
                    true
                }
                None => {
                    warn!("no log bundle available");
                    false
                }
            },
            Command::SetStartingUp => {
                self.peer_startups += 1;
                info!(
                    attempt = ?message.get_int(ATTEMPT),
                    total = self.peer_startups,
                    "peer is starting up"
                );
                true
            }
            Command::Unknown(name) => {
                warn!(cmd = %name, "unknown command");
                false
            }
        }
    }

    // ---- log pull ----

    /// Ask the peer for its log bundle. `completion` fires exactly once: with the bundle path,
    /// or with the first of unavailable / transport error / timeout / superseded /
    /// deactivated. Only one pull is tracked; a new pull supersedes the pending one.
    pub fn pull_logs(
        &mut self,
        deadline_ticks: u64,
        completion: LogPullCallback,
    ) -> Vec<OutboundAction> {
        let id = self.alloc_id();
        let pull = PendingLogPull::new(id, self.tick_count, deadline_ticks, completion);
        if let Some(old) = self.log_pull.arm(pull) {
            warn!(old = old.request_id, new = id, "log pull superseded");
            old.complete(Err(LogPullError::Superseded));
        }
        info!(id, deadline_ticks, "pulling logs");
        self.send_log_pull_command()
    }

    fn send_log_pull_command(&mut self) -> Vec<OutboundAction> {
        let Some(id) = self.log_pull.unsent_request_id() else {
            return vec![];
        };
        if !self.link.is_reachable() {
            warn!(id, "peer not reachable, getLogs deferred");
            return vec![];
        }
        self.log_pull.mark_sent();
        vec![OutboundAction::Send {
            id,
            message: PeerMessage::command(&Command::GetLogs),
            expects_reply: true,
        }]
    }

    /// Bulk file arrived. A `type == "log"` file resolves the pending log pull.
    pub fn on_file_received(&mut self, path: PathBuf, metadata: PeerMessage) -> Vec<OutboundAction> {
        if metadata.transfer_type() == Some(LOG_TRANSFER_TYPE) {
            if let Some(pull) = self.log_pull.take() {
                info!(id = pull.request_id, path = %path.display(), "log bundle received");
                pull.complete(Ok(path));
                return vec![];
            }
            info!(path = %path.display(), "log bundle arrived with no pending pull");
        }
        vec![OutboundAction::FileReceived { path, metadata }]
    }

    /// Sender side: a file transfer finished.
    pub fn on_file_transfer_finished(
        &mut self,
        path: PathBuf,
        metadata: PeerMessage,
        error: Option<String>,
    ) {
        if let Some(e) = error {
            error!(path = %path.display(), error = %e, "file transfer failed");
            return;
        }
        info!(
            path = %path.display(),
            kind = metadata.transfer_type().unwrap_or("-"),
            "file transfer finished"
        );
    }

    // ---- timers ----

    /// Periodic tick: expire the log pull and overdue replies. Each is claimed before its
    /// callback runs.
    pub fn tick(&mut self) {
        self.tick_count = self.tick_count.saturating_add(1);
        if let Some(pull) = self.log_pull.take_expired(self.tick_count) {
            warn!(id = pull.request_id, "log pull timed out");
            pull.complete(Err(LogPullError::Timeout));
        }
        for (id, request) in self.requests.take_expired(self.tick_count) {
            warn!(id, "request timed out");
            request.fail(LinkError::Timeout);
        }
    }

    // ---- external session ----

    /// Watch side: bring the external session to its prepared state, then tell the peer with
    /// `setStartingUp`. Each call counts as a new attempt; nothing retries automatically.
    pub fn start_external_session(&mut self) -> Vec<OutboundAction> {
        if self.role != Role::Watch {
            warn!(role = %self.role, "external session only runs on the watch");
            return vec![];
        }
        self.startup_attempts += 1;
        info!(attempt = self.startup_attempts, "starting external session");
        self.startup_notice_pending = true;
        let c = self.bridge.request_prepared();
        self.after_convergence(c)
    }

    pub fn on_session_state_changed(
        &mut self,
        session: SessionId,
        to: SessionState,
        from: SessionState,
    ) -> Vec<OutboundAction> {
        let c = self.bridge.on_state_changed(session, to, from);
        self.after_convergence(c)
    }

    pub fn on_session_failed(
        &mut self,
        session: SessionId,
        error: SessionError,
    ) -> Vec<OutboundAction> {
        let c = self.bridge.on_failed(session, &error);
        self.after_convergence(c)
    }

    pub fn on_session_event(&mut self, event: &str) {
        self.bridge.on_event(event);
    }

    fn after_convergence(&mut self, c: Convergence) -> Vec<OutboundAction> {
        if c != Convergence::Reached || !self.startup_notice_pending {
            return vec![];
        }
        self.startup_notice_pending = false;
        let attempt = self.startup_attempts;
        self.send(
            PeerMessage::starting_up(attempt),
            Some(Box::new(move |reply: PeerMessage| {
                info!(attempt, %reply, "setStartingUp acknowledged")
            })),
            Box::new(move |e: LinkError| warn!(attempt, error = %e, "setStartingUp failed")),
        )
    }
}
