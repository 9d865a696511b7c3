//! In-flight request bookkeeping: a table for ordinary sends and a single slot for log pulls.
//!
//! Every entry is removed from its container before its callback runs, and callbacks are
//! `FnOnce`, so an entry completes at most once no matter which path reaches it first.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{LinkError, LogPullError, ProtocolError};
use crate::message::{MessageKind, PeerMessage, KEY, MESSAGE, SUCCESS};

pub type ReplyCallback = Box<dyn FnOnce(PeerMessage) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(LinkError) + Send>;
pub type LogPullCallback = Box<dyn FnOnce(Result<PathBuf, LogPullError>) + Send>;

/// Shape a reply must have to match its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Relay acknowledgment: string `key` (or `message`).
    Ack,
    /// Command result: boolean `success`.
    CommandResult,
}

impl ReplyShape {
    pub fn for_request(request: &PeerMessage) -> Self {
        match request.kind() {
            MessageKind::Command(_) => ReplyShape::CommandResult,
            _ => ReplyShape::Ack,
        }
    }

    pub fn check(&self, reply: &PeerMessage) -> Result<(), ProtocolError> {
        match self {
            ReplyShape::Ack => {
                let (field, value) = match reply.get(KEY) {
                    Some(v) => (KEY, v),
                    None => match reply.get(MESSAGE) {
                        Some(v) => (MESSAGE, v),
                        None => return Err(ProtocolError::MissingField(KEY)),
                    },
                };
                if value.as_str().is_none() {
                    return Err(ProtocolError::WrongType {
                        field,
                        expected: "string",
                        found: value.type_name(),
                    });
                }
                Ok(())
            }
            ReplyShape::CommandResult => match reply.get(SUCCESS) {
                None => Err(ProtocolError::MissingField(SUCCESS)),
                Some(v) if v.as_bool().is_none() => Err(ProtocolError::WrongType {
                    field: SUCCESS,
                    expected: "bool",
                    found: v.type_name(),
                }),
                Some(_) => Ok(()),
            },
        }
    }
}

/// One outstanding send.
pub struct PendingRequest {
    pub issued_tick: u64,
    /// Only reply-expecting requests have a deadline.
    pub deadline_tick: Option<u64>,
    pub shape: ReplyShape,
    on_reply: Option<ReplyCallback>,
    on_error: ErrorCallback,
}

impl PendingRequest {
    pub fn new(
        issued_tick: u64,
        timeout_ticks: u64,
        shape: ReplyShape,
        on_reply: Option<ReplyCallback>,
        on_error: ErrorCallback,
    ) -> Self {
        let deadline_tick = on_reply
            .as_ref()
            .map(|_| issued_tick.saturating_add(timeout_ticks));
        Self {
            issued_tick,
            deadline_tick,
            shape,
            on_reply,
            on_error,
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.on_reply.is_some()
    }

    pub fn resolve(self, reply: PeerMessage) {
        if let Some(cb) = self.on_reply {
            cb(reply);
        }
    }

    pub fn fail(self, err: LinkError) {
        (self.on_error)(err);
    }
}

#[derive(Default)]
pub struct RequestTable {
    entries: HashMap<u64, PendingRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u64, request: PendingRequest) {
        self.entries.insert(id, request);
    }

    /// Claim an entry. The caller owns the only copy afterwards.
    pub fn take(&mut self, id: u64) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&PendingRequest> {
        self.entries.get(&id)
    }

    /// Claim every entry whose deadline has been reached at `now`.
    pub fn take_expired(&mut self, now: u64) -> Vec<(u64, PendingRequest)> {
        let mut ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, r)| r.deadline_tick.is_some_and(|d| now >= d))
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|r| (id, r)))
            .collect()
    }

    /// Claim everything, oldest first.
    pub fn drain(&mut self) -> Vec<(u64, PendingRequest)> {
        let mut all: Vec<(u64, PendingRequest)> = self.entries.drain().collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The outstanding log pull.
pub struct PendingLogPull {
    pub request_id: u64,
    pub issued_tick: u64,
    pub deadline_tick: u64,
    /// `getLogs` went out; false while waiting for the peer to become reachable.
    pub command_sent: bool,
    completion: LogPullCallback,
}

impl PendingLogPull {
    pub fn new(
        request_id: u64,
        issued_tick: u64,
        deadline_ticks: u64,
        completion: LogPullCallback,
    ) -> Self {
        Self {
            request_id,
            issued_tick,
            deadline_tick: issued_tick.saturating_add(deadline_ticks),
            command_sent: false,
            completion,
        }
    }

    pub fn complete(self, result: Result<PathBuf, LogPullError>) {
        (self.completion)(result);
    }
}

/// Single-slot holder for [`PendingLogPull`]. Last writer wins.
#[derive(Default)]
pub struct LogPullSlot {
    slot: Option<PendingLogPull>,
}

impl LogPullSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot, returning the pull it displaced, if any.
    pub fn arm(&mut self, pull: PendingLogPull) -> Option<PendingLogPull> {
        self.slot.replace(pull)
    }

    pub fn take(&mut self) -> Option<PendingLogPull> {
        self.slot.take()
    }

    /// Claim the pull if it was issued as request `id`.
    pub fn take_for_request(&mut self, id: u64) -> Option<PendingLogPull> {
        if self.request_id() == Some(id) {
            self.slot.take()
        } else {
            None
        }
    }

    /// Claim the pull if its deadline has been reached at `now`.
    pub fn take_expired(&mut self, now: u64) -> Option<PendingLogPull> {
        let expired = self
            .slot
            .as_ref()
            .is_some_and(|p| now >= p.deadline_tick);
        if expired {
            self.slot.take()
        } else {
            None
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.is_some()
    }

    /// Request id of an armed pull whose command has not gone out yet.
    pub fn unsent_request_id(&self) -> Option<u64> {
        self.slot
            .as_ref()
            .filter(|p| !p.command_sent)
            .map(|p| p.request_id)
    }

    pub fn mark_sent(&mut self) {
        if let Some(p) = self.slot.as_mut() {
            p.command_sent = true;
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        self.slot.as_ref().map(|p| p.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn counter() -> (Arc<Mutex<u32>>, ErrorCallback) {
        let n = Arc::new(Mutex::new(0));
        let n2 = n.clone();
        (n, Box::new(move |_| *n2.lock().unwrap() += 1))
    }

    #[test]
    fn ack_shape() {
        assert!(ReplyShape::Ack
            .check(&PeerMessage::relay("iPhone received"))
            .is_ok());
        assert_eq!(
            ReplyShape::Ack.check(&PeerMessage::success(true)),
            Err(ProtocolError::MissingField(KEY))
        );
        assert!(matches!(
            ReplyShape::Ack.check(&PeerMessage::from_pairs([(KEY, 5i64)])),
            Err(ProtocolError::WrongType { field: "key", .. })
        ));
    }

    #[test]
    fn command_result_shape() {
        assert!(ReplyShape::CommandResult
            .check(&PeerMessage::success(false))
            .is_ok());
        assert!(matches!(
            ReplyShape::CommandResult.check(&PeerMessage::from_pairs([(SUCCESS, "true")])),
            Err(ProtocolError::WrongType {
                expected: "bool",
                ..
            })
        ));
    }

    #[test]
    fn fire_and_forget_has_no_deadline() {
        let (_, on_error) = counter();
        let r = PendingRequest::new(4, 10, ReplyShape::Ack, None, on_error);
        assert_eq!(r.deadline_tick, None);
        assert!(!r.expects_reply());
    }

    #[test]
    fn take_expired_claims_only_overdue() {
        let mut table = RequestTable::new();
        let (fired, on_error) = counter();
        table.insert(
            1,
            PendingRequest::new(0, 2, ReplyShape::Ack, Some(Box::new(|_| {})), on_error),
        );
        let (_, on_error) = counter();
        table.insert(
            2,
            PendingRequest::new(0, 5, ReplyShape::Ack, Some(Box::new(|_| {})), on_error),
        );
        assert!(table.take_expired(1).is_empty());
        let expired = table.take_expired(2);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);
        for (_, r) in expired {
            r.fail(LinkError::Timeout);
        }
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(table.take(1).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn slot_is_last_writer_wins() {
        let mut slot = LogPullSlot::new();
        assert!(slot
            .arm(PendingLogPull::new(1, 0, 20, Box::new(|_| {})))
            .is_none());
        let displaced = slot.arm(PendingLogPull::new(2, 0, 20, Box::new(|_| {})));
        assert_eq!(displaced.map(|p| p.request_id), Some(1));
        assert_eq!(slot.request_id(), Some(2));
        assert_eq!(slot.unsent_request_id(), Some(2));
        slot.mark_sent();
        assert_eq!(slot.unsent_request_id(), None);
        assert!(slot.take_for_request(1).is_none());
        assert!(slot.take_for_request(2).is_some());
        assert!(!slot.is_armed());
    }

    #[test]
    fn slot_expires_at_deadline_once() {
        let mut slot = LogPullSlot::new();
        slot.arm(PendingLogPull::new(1, 5, 20, Box::new(|_| {})));
        assert!(slot.take_expired(24).is_none());
        assert!(slot.take_expired(25).is_some());
        assert!(slot.take_expired(26).is_none());
    }
}
