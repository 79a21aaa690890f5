//! Value types shared by the receipt engine and its collaborators.

use serde::{Deserialize, Serialize};

use crate::error::ReceiptError;

/// Identity of a receipt: who read, and which sent-at timestamp they acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiptKey {
    pub reader: String,
    pub timestamp: i64,
}

/// A validated "message was read" signal.
///
/// `timestamp` is the `sent_at` of the acknowledged message, not the time the
/// receipt was generated. Two receipts with the same reader and timestamp are
/// the same receipt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ReceiptPayload")]
pub struct ReadReceipt {
    reader: String,
    timestamp: i64,
}

impl ReadReceipt {
    pub fn new(reader: impl Into<String>, timestamp: i64) -> Result<Self, ReceiptError> {
        let reader = reader.into();
        if reader.trim().is_empty() {
            return Err(ReceiptError::MissingReader);
        }
        if timestamp <= 0 {
            return Err(ReceiptError::InvalidTimestamp(timestamp));
        }
        Ok(Self { reader, timestamp })
    }

    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn key(&self) -> ReceiptKey {
        ReceiptKey {
            reader: self.reader.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Receipt as it arrives from upstream, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptPayload {
    #[serde(default)]
    pub reader: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl TryFrom<ReceiptPayload> for ReadReceipt {
    type Error = ReceiptError;

    fn try_from(payload: ReceiptPayload) -> Result<Self, Self::Error> {
        let reader = payload.reader.ok_or(ReceiptError::MissingReader)?;
        let timestamp = payload.timestamp.ok_or(ReceiptError::MissingTimestamp)?;
        ReadReceipt::new(reader, timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// The subset of a stored message the receipt engine reads and mutates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sent_at: i64,
    pub direction: Direction,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub expiration_start_timestamp: Option<i64>,
    /// Disappearing-message timer, in seconds
    #[serde(default)]
    pub expire_timer: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub sent: bool,
}

impl Message {
    pub fn outgoing(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sent_at: i64,
    ) -> Self {
        Self::with_direction(id, conversation_id, sent_at, Direction::Outgoing)
    }

    pub fn incoming(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sent_at: i64,
    ) -> Self {
        Self::with_direction(id, conversation_id, sent_at, Direction::Incoming)
    }

    fn with_direction(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sent_at: i64,
        direction: Direction,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sent_at,
            direction,
            read_by: Vec::new(),
            expiration_start_timestamp: None,
            expire_timer: None,
            expires_at: None,
            sent: false,
        }
    }

    pub fn with_expire_timer(mut self, seconds: u64) -> Self {
        self.expire_timer = Some(seconds);
        self
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    /// Whether this is a disappearing message.
    pub fn is_expiring(&self) -> bool {
        self.expire_timer.is_some_and(|secs| secs > 0)
    }

    /// Arm the expiration countdown from the recorded start, or `now` if none.
    pub fn set_to_expire(&mut self, now: i64) {
        let Some(timer) = self.expire_timer.filter(|secs| *secs > 0) else {
            return;
        };
        let start = self.expiration_start_timestamp.unwrap_or(now);
        let millis = i64::try_from(timer.saturating_mul(1000)).unwrap_or(i64::MAX);
        self.expires_at = Some(start.saturating_add(millis));
    }

    /// Record a read by `reader`.
    ///
    /// The reader is appended at most once, the expiration start is only set
    /// on the first read, and the countdown is armed only when this call set it.
    /// Returns true when `read_by` changed.
    pub fn mark_read_by(&mut self, reader: &str, now: i64) -> bool {
        let added = if self.read_by.iter().any(|r| r == reader) {
            false
        } else {
            self.read_by.push(reader.to_string());
            true
        };

        let had_start = self.expiration_start_timestamp.is_some();
        self.expiration_start_timestamp = Some(self.expiration_start_timestamp.unwrap_or(now));
        self.sent = true;

        if self.is_expiring() && !had_start {
            self.set_to_expire(now);
        }

        added
    }

    /// Fold a later update of the same message into this one.
    ///
    /// Readers are unioned in order, the earliest expiration start and
    /// deadline are kept and `sent` never goes back to false, so an update
    /// built from a stale copy cannot drop an earlier read.
    pub fn absorb(&mut self, newer: Message) {
        for reader in newer.read_by {
            if !self.read_by.contains(&reader) {
                self.read_by.push(reader);
            }
        }
        self.expiration_start_timestamp =
            earliest(self.expiration_start_timestamp, newer.expiration_start_timestamp);
        self.expires_at = earliest(self.expires_at, newer.expires_at);
        self.sent |= newer.sent;
        if newer.expire_timer.is_some() {
            self.expire_timer = newer.expire_timer;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Group,
}

/// A direct or group conversation. Private conversations are keyed by the peer's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

impl Conversation {
    pub fn private(peer_id: impl Into<String>) -> Self {
        let id = peer_id.into();
        Self {
            member_ids: vec![id.clone()],
            id,
            kind: ConversationKind::Private,
        }
    }

    pub fn group<I, S>(id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            kind: ConversationKind::Group,
            member_ids: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_private(&self) -> bool {
        self.kind == ConversationKind::Private
    }

    pub fn get_member_ids(&self) -> &[String] {
        &self.member_ids
    }

    /// Ids a receipt reader may carry for a message in this conversation.
    pub fn receipt_readers(&self) -> Vec<&str> {
        if self.is_private() {
            vec![self.id.as_str()]
        } else {
            self.member_ids.iter().map(String::as_str).collect()
        }
    }

    pub fn involves(&self, member_id: &str) -> bool {
        self.member_ids.iter().any(|m| m == member_id)
    }
}

fn earliest(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
