//! Simulated workout sessions for the watch role. State changes are posted back through the
//! actor's event channel, so they arrive after the call that caused them returns.

use pairlink_core::{
    ExternalSession, SessionConfig, SessionError, SessionId, SessionSource, SessionState,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::actor::HostEvent;

/// Delegate callbacks of an external session, tagged with the session that raised them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        session: SessionId,
        to: SessionState,
        from: SessionState,
    },
    Failed {
        session: SessionId,
        error: SessionError,
    },
    Event(String),
}

pub struct SimulatedWorkouts {
    events: mpsc::UnboundedSender<HostEvent>,
}

impl SimulatedWorkouts {
    pub fn new(events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self { events }
    }
}

impl SessionSource for SimulatedWorkouts {
    fn create(
        &mut self,
        id: SessionId,
        config: &SessionConfig,
    ) -> Result<Box<dyn ExternalSession>, SessionError> {
        if self.events.is_closed() {
            return Err(SessionError::Create("event loop gone".into()));
        }
        info!(
            id,
            activity = %config.activity,
            location = %config.location,
            "workout session created"
        );
        Ok(Box::new(SimulatedWorkout {
            id,
            state: SessionState::NotStarted,
            events: self.events.clone(),
        }))
    }
}

struct SimulatedWorkout {
    id: SessionId,
    state: SessionState,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl SimulatedWorkout {
    fn move_to(&mut self, to: SessionState) {
        let from = self.state;
        self.state = to;
        let _ = self.events.send(HostEvent::Session(SessionEvent::StateChanged {
            session: self.id,
            to,
            from,
        }));
    }
}

impl ExternalSession for SimulatedWorkout {
    fn prepare(&mut self) {
        info!(id = self.id, state = %self.state, "workout prepare");
        if self.state == SessionState::NotStarted {
            let _ = self.events.send(HostEvent::Session(SessionEvent::Event(format!(
                "session {} warming up sensors",
                self.id
            ))));
            self.move_to(SessionState::Prepared);
        }
    }

    fn end(&mut self) {
        info!(id = self.id, state = %self.state, "workout end");
        if self.state != SessionState::Ended {
            self.move_to(SessionState::Ended);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_event(ev: Option<HostEvent>) -> SessionEvent {
        match ev {
            Some(HostEvent::Session(ev)) => ev,
            _ => panic!("expected a session event"),
        }
    }

    #[test]
    fn prepare_then_end_posts_state_changes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source = SimulatedWorkouts::new(tx);
        let mut session = source.create(7, &SessionConfig::default()).unwrap();
        assert!(rx.try_recv().is_err());

        session.prepare();
        assert!(matches!(
            session_event(rx.try_recv().ok()),
            SessionEvent::Event(_)
        ));
        assert_eq!(
            session_event(rx.try_recv().ok()),
            SessionEvent::StateChanged {
                session: 7,
                to: SessionState::Prepared,
                from: SessionState::NotStarted
            }
        );
        session.prepare();
        assert!(rx.try_recv().is_err());

        session.end();
        assert_eq!(
            session_event(rx.try_recv().ok()),
            SessionEvent::StateChanged {
                session: 7,
                to: SessionState::Ended,
                from: SessionState::Prepared
            }
        );
    }

    #[test]
    fn create_fails_without_event_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut source = SimulatedWorkouts::new(tx);
        assert!(source.create(1, &SessionConfig::default()).is_err());
    }
}
