/// Shared types for the conversation layer
use crate::error::{InboxError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical conversation key: booking, property and the unordered participant pair.
///
/// Encoded as `{booking_id}:{property_id}:{low}:{high}` with the participant ids
/// sorted, so both sides of a conversation derive the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey {
    pub booking_id: String,
    pub property_id: String,
    low: String,
    high: String,
}

impl ThreadKey {
    pub fn new(booking_id: &str, property_id: &str, a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            booking_id: booking_id.to_string(),
            property_id: property_id.to_string(),
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [booking, property, a, b]
                if parts.iter().all(|p| !p.is_empty()) && a != b =>
            {
                Ok(Self::new(booking, property, a, b))
            }
            _ => Err(InboxError::Validation(format!("malformed thread id: {}", s))),
        }
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The other participant, if `user_id` is one of the pair
    pub fn counterparty(&self, user_id: &str) -> Option<&str> {
        if self.low == user_id {
            Some(&self.high)
        } else if self.high == user_id {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.booking_id, self.property_id, self.low, self.high)
    }
}

/// A persisted message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub booking_id: String,
    pub property_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

/// Input for a send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub booking_id: String,
    pub property_id: String,
    pub receiver_id: String,
    pub body: String,
}

/// Raw per-thread row returned by the store, before read-state is applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub booking_id: String,
    pub property_id: String,
    pub property_title: String,
    pub counterparty_id: String,
    pub counterparty_name: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub last_message_id: String,
    /// `created_at` of every message addressed to the user that the server still reports unread
    pub unread_at: Vec<DateTime<Utc>>,
}

/// Conversation view shown in thread lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub booking_id: String,
    pub property_id: String,
    pub property_title: String,
    pub counterparty_id: String,
    pub counterparty_name: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub last_message_id: String,
    pub unread_count: u32,
}

/// Delivery state of a displayed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Delivery {
    /// Shown optimistically, insert still in flight
    Pending { temp_id: String },
    /// Persisted by the store
    Confirmed { server_id: String },
    /// Insert failed; kept in place until retried or discarded
    Failed { temp_id: String, reason: String },
}

impl Delivery {
    pub fn is_local(&self) -> bool {
        !matches!(self, Delivery::Confirmed { .. })
    }
}

/// One row of an open thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub message: Message,
    pub delivery: Delivery,
}

/// Read-status filter for thread lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFilter {
    #[default]
    All,
    Unread,
    Read,
}

impl std::str::FromStr for ReadFilter {
    type Err = InboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "all" => Ok(ReadFilter::All),
            "unread" => Ok(ReadFilter::Unread),
            "read" => Ok(ReadFilter::Read),
            other => Err(InboxError::Validation(format!("unknown status filter: {}", other))),
        }
    }
}

/// Search + status filter for `threads()`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadFilter {
    pub query: Option<String>,
    pub status: ReadFilter,
}

impl ThreadFilter {
    pub fn unread() -> Self {
        Self {
            query: None,
            status: ReadFilter::Unread,
        }
    }

    pub fn matching(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            status: ReadFilter::All,
        }
    }
}

/// Change notifications pushed by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A message addressed to `receiver_id` was inserted
    Inserted { receiver_id: String },
    /// A message addressed to `receiver_id` changed (read flag)
    Updated { receiver_id: String },
}

impl ChangeEvent {
    pub fn receiver_id(&self) -> &str {
        match self {
            ChangeEvent::Inserted { receiver_id } | ChangeEvent::Updated { receiver_id } => {
                receiver_id
            }
        }
    }
}
