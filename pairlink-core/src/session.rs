//! External session bridge: keeps at most one long-lived external session (e.g. a workout
//! session) and steps it toward the prepared foreground state.
//!
//! Expected progression: absent -> notStarted -> prepared -> ended -> absent.
//! Running, paused and stopped are never a target here; seeing one during bootstrap ends the
//! session. Reconciliation is an explicit stepping loop with a step budget, driven by the
//! delegate callbacks the host feeds in.
//!
//! Assumption: a session that never leaves `running` after `end()` gets exactly one `end()`
//! call and is then left alone until the external framework reports a new state.
//!
//! Every created session gets a fresh `SessionId`. Delegate callbacks carry the id of the
//! session that produced them; callbacks from a discarded session are dropped.

use std::fmt;

use tracing::{debug, info, warn};

/// Upper bound on steps per reconcile pass. A full cycle (ended -> absent -> create ->
/// prepare) takes three.
pub const MAX_RECONCILE_STEPS: usize = 8;

/// Identity of one created session object. Ids start at 1 and are never reused.
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session object exists.
    Absent,
    NotStarted,
    Prepared,
    Running,
    Paused,
    Stopped,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Absent => "absent",
            SessionState::NotStarted => "notStarted",
            SessionState::Prepared => "prepared",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
            SessionState::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration handed to the session source on create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub activity: String,
    pub location: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            activity: "walking".into(),
            location: "indoor".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("failed to create session: {0}")]
    Create(String),
    #[error("session failed: {0}")]
    Failed(String),
}

/// Handle to one external session object. State changes come back asynchronously through
/// the delegate callbacks, never as return values.
pub trait ExternalSession: Send {
    fn prepare(&mut self);
    fn end(&mut self);
}

/// Factory for external sessions. The session must tag its delegate callbacks with `id`.
pub trait SessionSource: Send {
    fn create(
        &mut self,
        id: SessionId,
        config: &SessionConfig,
    ) -> Result<Box<dyn ExternalSession>, SessionError>;
}

/// Result of a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// No target set.
    Idle,
    /// Target reached during this pass.
    Reached,
    /// Waiting for a delegate callback.
    Waiting,
    /// Session could not be created; target kept and the next request retries the create.
    CreateFailed,
    /// Step budget exhausted.
    Stalled,
}

enum Step {
    Continue,
    Stop(Convergence),
}

pub struct SessionBridge {
    source: Box<dyn SessionSource>,
    config: SessionConfig,
    session: Option<Box<dyn ExternalSession>>,
    /// Id of the live session, or of the last one created.
    generation: SessionId,
    state: SessionState,
    foreground_requested: bool,
    prepare_requested: bool,
    end_requested: bool,
}

impl SessionBridge {
    pub fn new(source: Box<dyn SessionSource>, config: SessionConfig) -> Self {
        Self {
            source,
            config,
            session: None,
            generation: 0,
            state: SessionState::Absent,
            foreground_requested: false,
            prepare_requested: false,
            end_requested: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Id of the live session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|_| self.generation)
    }

    pub fn is_target_pending(&self) -> bool {
        self.foreground_requested
    }

    /// Set the prepared target and reconcile. A second request while a live session is
    /// working toward the target is rejected with a warning; with no live session (the last
    /// create failed) the create is retried.
    pub fn request_prepared(&mut self) -> Convergence {
        if self.foreground_requested {
            if self.session.is_none() {
                info!("retrying session create");
                return self.reconcile();
            }
            warn!(state = %self.state, "foreground request already in progress");
            return Convergence::Waiting;
        }
        self.foreground_requested = true;
        self.reconcile()
    }

    pub fn clear_target(&mut self) {
        self.foreground_requested = false;
    }

    fn is_live(&self, id: SessionId) -> bool {
        self.session_id() == Some(id)
    }

    /// Delegate: state changed.
    pub fn on_state_changed(
        &mut self,
        id: SessionId,
        to: SessionState,
        from: SessionState,
    ) -> Convergence {
        info!(session = id, %to, %from, "session state changed");
        if !self.is_live(id) {
            warn!(
                session = id,
                live = ?self.session_id(),
                %to,
                "state change from a session that is not live, ignoring"
            );
            return Convergence::Idle;
        }
        self.state = to;
        self.reconcile()
    }

    /// Delegate: session failed. The session is treated as ended.
    pub fn on_failed(&mut self, id: SessionId, error: &SessionError) -> Convergence {
        warn!(session = id, %error, state = %self.state, "session failed");
        if !self.is_live(id) {
            debug!(session = id, "failure from a session that is not live, ignoring");
            return Convergence::Idle;
        }
        self.state = SessionState::Ended;
        self.reconcile()
    }

    /// Delegate: session generated an event. Diagnostic only.
    pub fn on_event(&mut self, event: &str) {
        info!(event, state = %self.state, "session event");
    }

    pub fn reconcile(&mut self) -> Convergence {
        debug!(state = %self.state, target = self.foreground_requested, "reconcile");
        for _ in 0..MAX_RECONCILE_STEPS {
            match self.step() {
                Step::Continue => {}
                Step::Stop(c) => return c,
            }
        }
        warn!(state = %self.state, "reconcile step budget exhausted");
        Convergence::Stalled
    }

    fn step(&mut self) -> Step {
        if self.state == SessionState::Ended {
            debug!("discarding ended session");
            self.session = None;
            self.state = SessionState::Absent;
            return Step::Continue;
        }
        if !self.foreground_requested {
            return Step::Stop(Convergence::Idle);
        }
        match self.state {
            SessionState::Absent => match self.source.create(self.generation + 1, &self.config) {
                Ok(session) => {
                    self.generation += 1;
                    info!(
                        session = self.generation,
                        activity = %self.config.activity,
                        "session created"
                    );
                    self.session = Some(session);
                    self.state = SessionState::NotStarted;
                    self.prepare_requested = false;
                    self.end_requested = false;
                    Step::Continue
                }
                Err(e) => {
                    warn!(session = self.generation + 1, error = %e, "failed to create session");
                    Step::Stop(Convergence::CreateFailed)
                }
            },
            SessionState::NotStarted => {
                if !self.prepare_requested {
                    self.prepare_requested = true;
                    if let Some(s) = self.session.as_mut() {
                        s.prepare();
                    }
                }
                Step::Stop(Convergence::Waiting)
            }
            SessionState::Prepared => {
                info!("prepared state reached");
                self.foreground_requested = false;
                Step::Stop(Convergence::Reached)
            }
            SessionState::Running | SessionState::Paused | SessionState::Stopped => {
                warn!(state = %self.state, "unexpected session state, ending session");
                if !self.end_requested {
                    self.end_requested = true;
                    if let Some(s) = self.session.as_mut() {
                        s.end();
                    }
                }
                Step::Stop(Convergence::Waiting)
            }
            SessionState::Ended => Step::Continue,
        }
    }
}
