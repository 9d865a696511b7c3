//! Single sequencing task: owns the manager, drains `HostEvent`s and performs the actions the
//! manager returns. Callbacks run here; anything user-facing goes to the UI channel.

use std::path::PathBuf;

use pairlink_core::{
    ErrorCallback, LinkError, LogPullError, OutboundAction, PeerMessage, PeerSessionManager,
    ReplyCallback, SessionError,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::console::{UiCommand, HELP};
use crate::transport::{LinkCommand, TransportEvent};
use crate::workout::SessionEvent;

#[derive(Debug)]
pub enum HostEvent {
    Transport(TransportEvent),
    Session(SessionEvent),
    Input(UiCommand),
    /// One-second timer.
    Tick,
}

pub struct Actor {
    manager: PeerSessionManager,
    link: mpsc::UnboundedSender<LinkCommand>,
    ui: mpsc::UnboundedSender<String>,
    log_pull_deadline: u64,
}

impl Actor {
    pub fn new(
        manager: PeerSessionManager,
        link: mpsc::UnboundedSender<LinkCommand>,
        ui: mpsc::UnboundedSender<String>,
        log_pull_deadline: u64,
    ) -> Self {
        Self {
            manager,
            link,
            ui,
            log_pull_deadline,
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<HostEvent>) {
        while let Some(ev) = events.recv().await {
            if !self.handle(ev) {
                break;
            }
        }
        info!("event loop stopped");
    }

    /// Handle one event. Returns false when the host should shut down.
    pub fn handle(&mut self, ev: HostEvent) -> bool {
        match ev {
            HostEvent::Tick => self.manager.tick(),
            HostEvent::Transport(ev) => self.on_transport(ev),
            HostEvent::Session(ev) => self.on_session(ev),
            HostEvent::Input(UiCommand::Quit) => return false,
            HostEvent::Input(cmd) => self.on_input(cmd),
        }
        true
    }

    /// Carry out manager actions.
    pub fn perform(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Activate => self.to_link(LinkCommand::Activate),
                OutboundAction::Send {
                    id,
                    message,
                    expects_reply,
                } => self.to_link(LinkCommand::Send {
                    id,
                    message,
                    expects_reply,
                }),
                OutboundAction::TransferFile { path, metadata } => {
                    self.to_link(LinkCommand::TransferFile { path, metadata })
                }
                OutboundAction::Deliver(text) => self.say(format!("received: {}", text)),
                OutboundAction::FileReceived { path, metadata } => {
                    self.say(format!("file received: {} {}", path.display(), metadata))
                }
            }
        }
    }

    fn on_transport(&mut self, ev: TransportEvent) {
        let actions = match ev {
            TransportEvent::ActivationCompleted(state) => {
                self.manager.on_activation_complete(state, None)
            }
            TransportEvent::Reachability(reachable) => {
                self.say(format!("peer reachable: {}", reachable));
                self.manager.on_reachability_changed(reachable)
            }
            TransportEvent::PeerInstalled(installed) => {
                self.manager.on_peer_installed_changed(installed)
            }
            TransportEvent::Deactivated => self.manager.on_session_deactivated(),
            TransportEvent::Delivered(id) => {
                self.manager.on_send_delivered(id);
                vec![]
            }
            TransportEvent::SendFailed(id, reason) => {
                self.manager.on_send_failed(id, reason);
                vec![]
            }
            TransportEvent::Message {
                id,
                expects_reply,
                payload,
            } => {
                let received = self.manager.on_message_received(payload, expects_reply);
                if let Some(reply) = received.reply {
                    self.to_link(LinkCommand::Reply { id, message: reply });
                }
                received.actions
            }
            TransportEvent::Reply { id, payload } => {
                if let Err(e) = self.manager.on_reply_received(id, payload) {
                    self.say(format!("protocol error: {}", e));
                }
                vec![]
            }
            TransportEvent::FileReceived { path, metadata } => {
                self.manager.on_file_received(path, metadata)
            }
            TransportEvent::FileFinished {
                path,
                metadata,
                error,
            } => {
                self.manager.on_file_transfer_finished(path, metadata, error);
                vec![]
            }
        };
        self.perform(actions);
    }

    fn on_session(&mut self, ev: SessionEvent) {
        let actions = match ev {
            SessionEvent::StateChanged { session, to, from } => {
                self.manager.on_session_state_changed(session, to, from)
            }
            SessionEvent::Failed { session, error } => {
                self.manager.on_session_failed(session, error)
            }
            SessionEvent::Event(name) => {
                self.manager.on_session_event(&name);
                vec![]
            }
        };
        self.perform(actions);
    }

    fn on_input(&mut self, cmd: UiCommand) {
        debug!(?cmd, "ui command");
        let actions = match cmd {
            UiCommand::Send(text) => {
                let on_error = self.error_printer();
                let actions = self.manager.send_relay(&text, None, on_error);
                self.report_if_dropped(&actions);
                actions
            }
            UiCommand::Ask(text) => {
                let ui = self.ui.clone();
                let on_reply: ReplyCallback = Box::new(move |reply: PeerMessage| {
                    let text = reply.relay_text().unwrap_or_default().to_string();
                    let _ = ui.send(format!("reply: {}", text));
                });
                let on_error = self.error_printer();
                let actions = self.manager.send_relay(&text, Some(on_reply), on_error);
                self.report_if_dropped(&actions);
                actions
            }
            UiCommand::PullLogs(secs) => {
                let ui = self.ui.clone();
                let deadline = secs.unwrap_or(self.log_pull_deadline);
                self.manager.pull_logs(
                    deadline,
                    Box::new(move |result: Result<PathBuf, LogPullError>| {
                        let line = match result {
                            Ok(path) => format!("logs received: {}", path.display()),
                            Err(e) => format!("log pull failed: {}", e),
                        };
                        let _ = ui.send(line);
                    }),
                )
            }
            UiCommand::StartSession => self.manager.start_external_session(),
            UiCommand::FailSession => {
                match self.manager.session_id() {
                    Some(session) => {
                        let error = SessionError::Failed("failure requested from console".into());
                        self.on_session(SessionEvent::Failed { session, error });
                    }
                    None => self.say("no live session".to_string()),
                }
                vec![]
            }
            UiCommand::Status => {
                self.say(self.status_line());
                vec![]
            }
            UiCommand::Deactivate => {
                self.to_link(LinkCommand::Deactivate);
                vec![]
            }
            UiCommand::Help => {
                self.say(HELP.to_string());
                vec![]
            }
            UiCommand::Quit => vec![],
        };
        self.perform(actions);
    }

    fn error_printer(&self) -> ErrorCallback {
        let ui = self.ui.clone();
        Box::new(move |e: LinkError| {
            let _ = ui.send(format!("send failed: {}", e));
        })
    }

    fn report_if_dropped(&self, actions: &[OutboundAction]) {
        if actions.is_empty() {
            self.say(format!("not sent: {}", LinkError::NotReachable));
        }
    }

    fn status_line(&self) -> String {
        let status = self.manager.status();
        format!(
            "role={} activation={} reachable={} peer_installed={} session={} \
             startup_attempts={} peer_startups={} pending_requests={} log_pull_pending={}",
            self.manager.role(),
            status.activation,
            status.reachable,
            status.peer_installed,
            self.manager.session_state(),
            self.manager.startup_attempts(),
            self.manager.peer_startups(),
            self.manager.pending_requests(),
            self.manager.has_pending_log_pull(),
        )
    }

    fn to_link(&self, cmd: LinkCommand) {
        if self.link.send(cmd).is_err() {
            warn!("link task gone, command dropped");
        }
    }

    fn say(&self, line: String) {
        let _ = self.ui.send(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workout::SimulatedWorkouts;
    use pairlink_core::{ActivationState, ManagerConfig, Role, SessionState};

    struct Harness {
        actor: Actor,
        link: mpsc::UnboundedReceiver<LinkCommand>,
        ui: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedReceiver<HostEvent>,
    }

    fn harness(role: Role, bundle: Option<PathBuf>) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (link_tx, link) = mpsc::unbounded_channel();
        let (ui_tx, ui) = mpsc::unbounded_channel();
        let manager = PeerSessionManager::new(
            role,
            ManagerConfig::default(),
            Box::new(move || bundle.clone()),
            Box::new(SimulatedWorkouts::new(events_tx)),
        );
        Harness {
            actor: Actor::new(manager, link_tx, ui_tx, 20),
            link,
            ui,
            events,
        }
    }

    impl Harness {
        fn bring_up(&mut self) {
            let actions = self.actor.manager.activate(true).unwrap();
            self.actor.perform(actions);
            assert!(matches!(self.link.try_recv(), Ok(LinkCommand::Activate)));
            self.transport(TransportEvent::ActivationCompleted(ActivationState::Activated));
            self.transport(TransportEvent::Reachability(true));
            assert_eq!(
                self.actor.manager.status().activation,
                ActivationState::Activated
            );
        }

        fn transport(&mut self, ev: TransportEvent) {
            assert!(self.actor.handle(HostEvent::Transport(ev)));
        }

        fn input(&mut self, cmd: UiCommand) -> bool {
            self.actor.handle(HostEvent::Input(cmd))
        }

        /// Feed queued session callbacks back in, as the event loop would.
        fn pump_session_events(&mut self) {
            while let Ok(ev) = self.events.try_recv() {
                assert!(self.actor.handle(ev));
            }
        }

        fn ui_lines(&mut self) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(line) = self.ui.try_recv() {
                out.push(line);
            }
            out
        }
    }

    #[test]
    fn ask_round_trip_prints_reply() {
        let mut h = harness(Role::Phone, None);
        h.bring_up();
        assert!(h.input(UiCommand::Ask("action button".into())));
        let id = match h.link.try_recv() {
            Ok(LinkCommand::Send {
                id,
                message,
                expects_reply: true,
            }) => {
                assert_eq!(message.relay_text(), Some("from phone: action button"));
                id
            }
            other => panic!("expected send, got {:?}", other),
        };
        h.transport(TransportEvent::Delivered(id));
        h.transport(TransportEvent::Reply {
            id,
            payload: PeerMessage::relay("Watch received"),
        });
        assert!(h.ui_lines().contains(&"reply: Watch received".to_string()));
    }

    #[test]
    fn inbound_relay_is_acked_and_printed() {
        let mut h = harness(Role::Phone, None);
        h.bring_up();
        h.ui_lines();
        h.transport(TransportEvent::Message {
            id: 4,
            expects_reply: true,
            payload: PeerMessage::relay("from Watch: action button"),
        });
        match h.link.try_recv() {
            Ok(LinkCommand::Reply { id: 4, message }) => {
                assert_eq!(message, PeerMessage::relay("iPhone received"))
            }
            other => panic!("expected reply, got {:?}", other),
        }
        assert_eq!(h.ui_lines(), vec!["received: from Watch: action button"]);
    }

    #[test]
    fn get_logs_request_transfers_bundle() {
        let mut h = harness(Role::Watch, Some(PathBuf::from("/tmp/log_bundle.txt")));
        h.bring_up();
        while h.link.try_recv().is_ok() {}
        h.transport(TransportEvent::Message {
            id: 1,
            expects_reply: true,
            payload: PeerMessage::command(&pairlink_core::Command::GetLogs),
        });
        assert!(matches!(
            h.link.try_recv(),
            Ok(LinkCommand::Reply { id: 1, message }) if message == PeerMessage::success(true)
        ));
        assert!(matches!(
            h.link.try_recv(),
            Ok(LinkCommand::TransferFile { path, .. }) if path == PathBuf::from("/tmp/log_bundle.txt")
        ));
    }

    #[test]
    fn watch_announces_startup_after_session_prepared() {
        let mut h = harness(Role::Watch, None);
        h.bring_up();
        h.pump_session_events();
        assert_eq!(h.actor.manager.session_state(), SessionState::Prepared);
        let sent: Vec<_> = std::iter::from_fn(|| h.link.try_recv().ok()).collect();
        assert!(sent.iter().any(|c| matches!(
            c,
            LinkCommand::Send { message, .. }
                if message.kind() == pairlink_core::MessageKind::Command(
                    pairlink_core::Command::SetStartingUp
                )
        )));
    }

    #[test]
    fn log_pull_times_out_on_ticks() {
        let mut h = harness(Role::Phone, None);
        h.bring_up();
        h.input(UiCommand::PullLogs(Some(3)));
        for _ in 0..3 {
            assert!(h.actor.handle(HostEvent::Tick));
        }
        assert!(h
            .ui_lines()
            .iter()
            .any(|l| l.starts_with("log pull failed")));
    }

    #[test]
    fn unreachable_send_is_reported() {
        let mut h = harness(Role::Phone, None);
        h.input(UiCommand::Send("hello".into()));
        assert!(h.link.try_recv().is_err());
        assert_eq!(h.ui_lines(), vec!["not sent: peer not reachable"]);
    }

    #[test]
    fn deactivation_reactivates_link() {
        let mut h = harness(Role::Phone, None);
        h.bring_up();
        h.transport(TransportEvent::Deactivated);
        assert!(matches!(h.link.try_recv(), Ok(LinkCommand::Activate)));
        assert!(h.link.try_recv().is_err());
    }

    #[test]
    fn session_failure_recreates_session() {
        let mut h = harness(Role::Watch, None);
        h.bring_up();
        h.input(UiCommand::FailSession);
        assert_eq!(h.actor.manager.session_id(), Some(2));
        // Session 1's queued callbacks are dropped; session 2's prepare completes.
        h.pump_session_events();
        assert_eq!(h.actor.manager.session_state(), SessionState::Prepared);
        assert_eq!(h.actor.manager.session_id(), Some(2));
        let startups = std::iter::from_fn(|| h.link.try_recv().ok())
            .filter(|c| {
                matches!(
                    c,
                    LinkCommand::Send { message, .. }
                        if message.kind() == pairlink_core::MessageKind::Command(
                            pairlink_core::Command::SetStartingUp
                        )
                )
            })
            .count();
        assert_eq!(startups, 1);
    }

    #[test]
    fn stale_session_event_is_ignored() {
        let mut h = harness(Role::Watch, None);
        h.bring_up();
        h.pump_session_events();
        assert_eq!(h.actor.manager.session_state(), SessionState::Prepared);
        assert!(h.actor.handle(HostEvent::Session(SessionEvent::StateChanged {
            session: 9,
            to: SessionState::Running,
            from: SessionState::Prepared,
        })));
        assert_eq!(h.actor.manager.session_state(), SessionState::Prepared);
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn fail_session_without_live_session_is_reported() {
        let mut h = harness(Role::Phone, None);
        h.input(UiCommand::FailSession);
        assert_eq!(h.ui_lines(), vec!["no live session"]);
    }

    #[test]
    fn quit_stops_the_loop() {
        let mut h = harness(Role::Phone, None);
        assert!(!h.input(UiCommand::Quit));
    }
}
