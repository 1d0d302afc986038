/// Inbox core - conversation and notification engine for a booking dashboard
///
/// Guest/host messaging per booking: thread aggregation, client-side read
/// markers, optimistic sends, real-time re-fetch and the unread badge.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod booking_store;
pub mod message_store;
pub mod read_state;
pub mod aggregator;
pub mod badge;
pub mod realtime;
pub mod controller;
pub mod inbox_api;
pub mod cli_app;

pub use error::{ErrorKind, InboxError, Result};
pub use config::Config;
pub use badge::BadgeFeed;
pub use booking_store::{Booking, BookingStore, Participant};
pub use controller::{ControllerStatus, ConversationController, Selection};
pub use message_store::{MessageStore, SledMessageStore};
pub use messenger_types::{
    Delivery, DisplayMessage, Message, NewMessage, ReadFilter, Thread, ThreadFilter, ThreadKey,
};
pub use read_state::ReadStateCache;
