//! Correlation of in-flight requests with their responses.
//!
//! Every correlated request sits in this table from publish until a
//! matching response arrives, the deadline passes, or the request is
//! cancelled - whichever comes first. Entries leave the table exactly once,
//! so a timed-out request can never also resolve later (the late response
//! is classified as stale and dropped by the caller).

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::command::Command;
use crate::envelope::MessageId;
use crate::topic::Channel;

#[derive(Debug, Error)]
pub enum RegisterError {
    /// Message ids are unique by construction, but the transport or the
    /// device can duplicate traffic; the new registration loses and the
    /// caller regenerates the id.
    #[error("duplicate message id {0}")]
    DuplicateMessageId(String),
}

/// One in-flight request awaiting its response.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub command: Command,
    pub channel: Channel,
    pub message_id: MessageId,
    /// Request fields, kept so a retry can resend the same content.
    pub fields: Map<String, Value>,
    pub submitted_at_ms: i64,
    pub deadline_ms: i64,
    /// 0 on first send, 1 on the retry.
    pub attempt: u32,
}

#[derive(Default)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request: PendingRequest) -> Result<(), RegisterError> {
        let key = request.message_id.as_str().to_string();
        if self.pending.contains_key(&key) {
            return Err(RegisterError::DuplicateMessageId(key));
        }
        self.pending.insert(key, request);
        Ok(())
    }

    /// Match a response to its pending request. `None` means no matching
    /// entry (stale, duplicate, or device-originated id) - the caller logs
    /// and moves on. A channel mismatch is treated the same way: the
    /// request/response pair must ride the same channel.
    pub fn resolve(&mut self, channel: Channel, message_id: &str) -> Option<PendingRequest> {
        match self.pending.get(message_id) {
            Some(pending) if pending.channel == channel => self.pending.remove(message_id),
            _ => None,
        }
    }

    /// Evict every entry past its deadline. Each expired request is
    /// returned exactly once, oldest deadline first.
    pub fn sweep(&mut self, now_ms: i64) -> Vec<PendingRequest> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline_ms <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        let mut requests: Vec<PendingRequest> = expired
            .into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .collect();
        requests.sort_by_key(|p| p.deadline_ms);
        requests
    }

    /// Drop every pending request, e.g. when the transport goes away and
    /// all of them are aborted.
    pub fn cancel_all(&mut self) -> Vec<PendingRequest> {
        self.pending.drain().map(|(_, p)| p).collect()
    }

    /// Cancel one request explicitly, releasing its slot immediately.
    pub fn cancel(&mut self, message_id: &str) -> Option<PendingRequest> {
        self.pending.remove(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
