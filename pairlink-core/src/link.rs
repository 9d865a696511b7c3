//! Link activation and reachability state machine.
//!
//! Pure state holder: transport-originated events go in, a [`Transition`] comes out.
//! The manager decides what the transition triggers.

use std::fmt;

use tracing::{debug, info, warn};

/// Activation phase of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    NotActivated,
    Inactive,
    Activated,
}

impl ActivationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationState::NotActivated => "notActivated",
            ActivationState::Inactive => "inactive",
            ActivationState::Activated => "activated",
        }
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable snapshot of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub activation: ActivationState,
    pub reachable: bool,
    pub peer_installed: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            activation: ActivationState::NotActivated,
            reachable: false,
            peer_installed: false,
        }
    }
}

/// Events reported by the link transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ActivationCompleted {
        state: ActivationState,
        error: Option<String>,
    },
    ReachabilityChanged(bool),
    PeerInstalledChanged(bool),
    BecameInactive,
    /// Link deactivated (e.g. paired peer switched). Always requires re-activation.
    Deactivated,
}

/// What an applied event changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Link moved into `Activated` from any other phase.
    pub entered_activated: bool,
    pub reachability_changed: bool,
    /// Host must call `activate` on the transport again.
    pub reactivate: bool,
}

#[derive(Debug, Default)]
pub struct LinkStateMachine {
    status: LinkStatus,
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_reachable(&self) -> bool {
        self.status.reachable
    }

    pub fn is_activated(&self) -> bool {
        self.status.activation == ActivationState::Activated
    }

    pub fn apply(&mut self, event: LinkEvent) -> Transition {
        let mut t = Transition::default();
        let was_reachable = self.status.reachable;
        match event {
            LinkEvent::ActivationCompleted { state, error } => {
                if let Some(e) = &error {
                    warn!(%state, error = %e, "activation completed with error");
                } else {
                    info!(%state, "activation completed");
                }
                t.entered_activated = state == ActivationState::Activated
                    && self.status.activation != ActivationState::Activated;
                self.status.activation = state;
                if state != ActivationState::Activated {
                    self.status.reachable = false;
                }
            }
            LinkEvent::ReachabilityChanged(reachable) => {
                if reachable && !self.is_activated() {
                    debug!(activation = %self.status.activation, "ignoring reachability before activation");
                    self.status.reachable = false;
                } else {
                    self.status.reachable = reachable;
                }
                info!(
                    reachable = self.status.reachable,
                    activation = %self.status.activation,
                    "reachability changed"
                );
            }
            LinkEvent::PeerInstalledChanged(installed) => {
                info!(installed, "peer app installed changed");
                self.status.peer_installed = installed;
            }
            LinkEvent::BecameInactive => {
                info!("link became inactive");
                self.status.activation = ActivationState::Inactive;
                self.status.reachable = false;
            }
            LinkEvent::Deactivated => {
                info!("link deactivated, re-activating");
                self.status.activation = ActivationState::NotActivated;
                self.status.reachable = false;
                t.reactivate = true;
            }
        }
        t.reachability_changed = was_reachable != self.status.reachable;
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activated() -> LinkEvent {
        LinkEvent::ActivationCompleted {
            state: ActivationState::Activated,
            error: None,
        }
    }

    #[test]
    fn activation_then_reachable() {
        let mut sm = LinkStateMachine::new();
        let t = sm.apply(activated());
        assert!(t.entered_activated);
        let t = sm.apply(LinkEvent::ReachabilityChanged(true));
        assert!(t.reachability_changed);
        assert!(sm.is_reachable());
    }

    #[test]
    fn reachability_ignored_before_activation() {
        let mut sm = LinkStateMachine::new();
        let t = sm.apply(LinkEvent::ReachabilityChanged(true));
        assert!(!t.reachability_changed);
        assert!(!sm.is_reachable());
    }

    #[test]
    fn repeated_activation_completion_is_not_a_new_entry() {
        let mut sm = LinkStateMachine::new();
        assert!(sm.apply(activated()).entered_activated);
        assert!(!sm.apply(activated()).entered_activated);
    }

    #[test]
    fn deactivate_requests_reactivation_and_allows_reentry() {
        let mut sm = LinkStateMachine::new();
        sm.apply(activated());
        sm.apply(LinkEvent::ReachabilityChanged(true));
        let t = sm.apply(LinkEvent::Deactivated);
        assert!(t.reactivate);
        assert!(t.reachability_changed);
        assert_eq!(sm.status().activation, ActivationState::NotActivated);
        assert!(sm.apply(activated()).entered_activated);
    }

    #[test]
    fn inactive_drops_reachability() {
        let mut sm = LinkStateMachine::new();
        sm.apply(activated());
        sm.apply(LinkEvent::ReachabilityChanged(true));
        let t = sm.apply(LinkEvent::BecameInactive);
        assert!(!t.reactivate);
        assert!(!sm.is_reachable());
        assert_eq!(sm.status().activation, ActivationState::Inactive);
    }
}
