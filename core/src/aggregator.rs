/// Thread aggregation: raw store summaries + read markers -> thread views
use crate::messenger_types::{Message, ReadFilter, Thread, ThreadFilter, ThreadSummary};
use crate::read_state::ReadSnapshot;
use chrono::{DateTime, Utc};

/// Unread = server-unread and newer than the local marker
fn still_unread(created_at: DateTime<Utc>, last_read_at: Option<DateTime<Utc>>) -> bool {
    last_read_at.map_or(true, |read| created_at > read)
}

pub fn unread_count(unread_at: &[DateTime<Utc>], last_read_at: Option<DateTime<Utc>>) -> u32 {
    unread_at
        .iter()
        .filter(|at| still_unread(**at, last_read_at))
        .count() as u32
}

/// Same rule applied to a loaded message list
pub fn unread_in_messages(
    user_id: &str,
    messages: &[Message],
    last_read_at: Option<DateTime<Utc>>,
) -> u32 {
    messages
        .iter()
        .filter(|m| m.receiver_id == user_id && !m.is_read && still_unread(m.created_at, last_read_at))
        .count() as u32
}

pub fn build_thread(summary: ThreadSummary, snapshot: &ReadSnapshot) -> Thread {
    let unread_count = unread_count(&summary.unread_at, snapshot.last_read_at(&summary.thread_id));
    Thread {
        id: summary.thread_id,
        booking_id: summary.booking_id,
        property_id: summary.property_id,
        property_title: summary.property_title,
        counterparty_id: summary.counterparty_id,
        counterparty_name: summary.counterparty_name,
        last_message: summary.last_message,
        last_message_at: summary.last_message_at,
        last_message_id: summary.last_message_id,
        unread_count,
    }
}

/// Newest conversation first; ties broken by id so the order is stable across re-fetches
pub fn sort_threads(threads: &mut [Thread]) {
    threads.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub fn aggregate(summaries: Vec<ThreadSummary>, snapshot: &ReadSnapshot) -> Vec<Thread> {
    let mut threads: Vec<Thread> = summaries
        .into_iter()
        .map(|s| build_thread(s, snapshot))
        .collect();
    sort_threads(&mut threads);
    threads
}

pub fn matches(thread: &Thread, filter: &ThreadFilter) -> bool {
    let status_ok = match filter.status {
        ReadFilter::All => true,
        ReadFilter::Unread => thread.unread_count > 0,
        ReadFilter::Read => thread.unread_count == 0,
    };
    if !status_ok {
        return false;
    }

    match filter.query.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(query) => {
            let needle = query.to_lowercase();
            [
                &thread.property_title,
                &thread.counterparty_name,
                &thread.last_message,
            ]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
        }
    }
}

pub fn filter_threads(threads: &[Thread], filter: &ThreadFilter) -> Vec<Thread> {
    threads
        .iter()
        .filter(|t| matches(t, filter))
        .cloned()
        .collect()
}

pub fn unread_total(threads: &[Thread]) -> u32 {
    threads.iter().map(|t| t.unread_count).sum()
}
