/// Conversation controller tests: selection, optimistic sends, read-state and refresh
mod common;

use common::*;
use inbox_core::message_store::MessageStore;
use inbox_core::{
    ConversationController, Delivery, ErrorKind, InboxError, ReadStateCache, Selection,
    ThreadFilter, ThreadKey,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

async fn guest_session(store: &Arc<ScriptedStore>) -> ConversationController {
    let controller = ConversationController::new(
        store.clone(),
        ReadStateCache::in_memory(),
        &test_config(GUEST),
    );
    controller.start().await.unwrap();
    controller
}

fn bodies(rows: &[inbox_core::DisplayMessage]) -> Vec<&str> {
    rows.iter().map(|r| r.message.body.as_str()).collect()
}

#[tokio::test]
async fn test_open_thread_clears_unread_before_fetch_resolves() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Hi there").await;
    host_says(&store, &t, "Check-in is at 3pm").await;

    let controller = guest_session(&store).await;
    assert_eq!(controller.unread_total().await, 2);
    let badge = controller.badge();
    assert_eq!(badge.current(), 2);

    store.set_messages_delay(&t, Duration::from_millis(500));
    let selecting = {
        let controller = controller.clone();
        let t = t.clone();
        tokio::spawn(async move { controller.select_thread(&t).await })
    };

    assert!(wait_for(WAIT, &controller, |c| async move { c.unread_total().await == 0 }).await);
    assert_eq!(badge.current(), 0);
    assert!(matches!(controller.status().await.selection, Selection::Loading { .. }));

    let rows = selecting.await.unwrap().unwrap();
    assert_eq!(bodies(&rows), vec!["Hi there", "Check-in is at 3pm"]);
    assert!(matches!(controller.status().await.selection, Selection::Loaded { .. }));

    // Server flag catches up in the background
    assert!(
        wait_for(WAIT, &*store, |s| async move { s.count_unread(GUEST).await.unwrap() == 0 }).await
    );
    assert_eq!(controller.unread_total().await, 0);
}

#[tokio::test]
async fn test_select_is_idempotent() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Hi there").await;

    let controller = guest_session(&store).await;
    let first = controller.select_thread(&t).await.unwrap();
    let second = controller.select_thread(&t).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(controller.unread_total().await, 0);
}

#[tokio::test]
async fn test_select_rejects_foreign_thread() {
    let store = Arc::new(ScriptedStore::new());
    let controller = guest_session(&store).await;

    let foreign = ThreadKey::new("bk1", "p1", "alice", "bob").to_string();
    let err = controller.select_thread(&foreign).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = controller.select_thread("not-a-thread").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_messages_are_ascending() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    for body in ["one", "two", "three"] {
        host_says(&store, &t, body).await;
    }

    let controller = guest_session(&store).await;
    let rows = controller.select_thread(&t).await.unwrap();
    assert_eq!(bodies(&rows), vec!["one", "two", "three"]);
    assert!(rows
        .windows(2)
        .all(|w| w[0].message.created_at <= w[1].message.created_at));
}

#[tokio::test]
async fn test_optimistic_send_then_confirm_in_place() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;

    let controller = guest_session(&store).await;
    controller.select_thread(&t).await.unwrap();

    store.set_insert_delay(Duration::from_millis(300));
    let sending = {
        let controller = controller.clone();
        let t = t.clone();
        tokio::spawn(async move { controller.send_message(&t, "See you soon").await })
    };

    // Visible before the store answers
    assert!(wait_for(WAIT, &controller, |c| async move { c.outbox().await.len() == 1 }).await);
    let rows = controller.messages().await;
    let last = rows.last().unwrap();
    assert_eq!(last.message.body, "See you soon");
    assert!(matches!(last.delivery, Delivery::Pending { .. }));
    assert_eq!(controller.thread(&t).await.unwrap().last_message, "See you soon");
    assert_eq!(controller.status().await.pending_sends, 1);

    let stored = sending.await.unwrap().unwrap();
    let rows = controller.messages().await;
    assert_eq!(bodies(&rows), vec!["Welcome!", "See you soon"]);
    assert_eq!(
        rows[1].delivery,
        Delivery::Confirmed {
            server_id: stored.id.clone()
        }
    );
    assert!(controller.outbox().await.is_empty());
    assert_eq!(controller.thread(&t).await.unwrap().last_message_id, stored.id);

    // A later re-fetch must not duplicate it
    controller.on_realtime_event().await.unwrap();
    assert_eq!(bodies(&controller.messages().await), vec!["Welcome!", "See you soon"]);
}

#[tokio::test]
async fn test_empty_body_rejected_locally() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    let controller = guest_session(&store).await;

    let err = controller.send_message(&t, "   \n").await.unwrap_err();
    assert!(matches!(err, InboxError::Validation(_)));
    assert_eq!(store.insert_calls.load(Ordering::SeqCst), 0);
    assert!(controller.outbox().await.is_empty());
}

#[tokio::test]
async fn test_authorization_failure_removes_optimistic_message() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;

    let controller = guest_session(&store).await;
    controller.select_thread(&t).await.unwrap();

    store.script_next_insert(InsertScript::Fail(InboxError::Authorization(
        "booking cancelled".into(),
    )));
    let err = controller.send_message(&t, "Hello?").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    assert_eq!(bodies(&controller.messages().await), vec!["Welcome!"]);
    assert!(controller.outbox().await.is_empty());
    assert_eq!(controller.thread(&t).await.unwrap().last_message, "Welcome!");
}

#[tokio::test]
async fn test_send_into_unknown_booking_drops_created_row() {
    let store = Arc::new(ScriptedStore::new());
    let controller = guest_session(&store).await;

    let t = ThreadKey::new("bk404", "p1", GUEST, HOST).to_string();
    let err = controller.send_message(&t, "Is this still available?").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(controller.thread(&t).await.is_none());
    assert!(controller.threads(&ThreadFilter::default()).await.is_empty());
}

#[tokio::test]
async fn test_transient_failure_keeps_message_for_retry() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;

    let controller = guest_session(&store).await;
    controller.select_thread(&t).await.unwrap();

    store.script_next_insert(InsertScript::Fail(InboxError::Transient("timeout".into())));
    let err = controller.send_message(&t, "Can we check in early?").await.unwrap_err();
    assert!(err.is_transient());

    let outbox = controller.outbox().await;
    assert_eq!(outbox.len(), 1);
    let temp_id = match &outbox[0].delivery {
        Delivery::Failed { temp_id, .. } => temp_id.clone(),
        other => panic!("expected failed delivery, got {:?}", other),
    };
    assert_eq!(controller.status().await.failed_sends, 1);
    assert_eq!(
        bodies(&controller.messages().await),
        vec!["Welcome!", "Can we check in early?"]
    );

    let stored = controller.retry_send(&temp_id).await.unwrap();
    assert!(controller.outbox().await.is_empty());
    let rows = controller.messages().await;
    assert_eq!(bodies(&rows), vec!["Welcome!", "Can we check in early?"]);
    assert_eq!(rows[1].message.id, stored.id);

    // Retrying something that is not failed is a validation error
    let err = controller.retry_send(&temp_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_discard_failed_restores_thread_row() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;
    let controller = guest_session(&store).await;

    store.script_next_insert(InsertScript::Fail(InboxError::Transient("offline".into())));
    controller.send_message(&t, "Draft that never went out").await.unwrap_err();
    assert_eq!(
        controller.thread(&t).await.unwrap().last_message,
        "Draft that never went out"
    );

    let temp_id = controller.outbox().await[0].message.id.clone();
    controller.discard_failed(&temp_id).await.unwrap();
    assert!(controller.outbox().await.is_empty());
    assert_eq!(controller.thread(&t).await.unwrap().last_message, "Welcome!");
}

#[tokio::test]
async fn test_lost_response_reconciles_without_duplicate() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;

    let controller = guest_session(&store).await;
    controller.select_thread(&t).await.unwrap();

    store.script_next_insert(InsertScript::DropResponse);
    controller.send_message(&t, "Running late").await.unwrap_err();
    assert_eq!(controller.outbox().await.len(), 1);

    // The message did land; the next fetch absorbs the local copy
    let rows = controller.select_thread(&t).await.unwrap();
    assert_eq!(bodies(&rows), vec!["Welcome!", "Running late"]);
    assert!(rows.iter().all(|r| !r.delivery.is_local()));
    assert!(controller.outbox().await.is_empty());
}

#[tokio::test]
async fn test_stale_selection_is_discarded() {
    let store = Arc::new(ScriptedStore::new());
    let loft = seed_booking(&store, "bk1", "p1", "Beach Loft");
    let cabin = seed_booking(&store, "bk2", "p2", "Mountain Cabin");
    host_says(&store, &loft, "Loft message").await;
    host_says(&store, &cabin, "Cabin message").await;

    let controller = guest_session(&store).await;
    store.set_messages_delay(&loft, Duration::from_millis(300));

    let slow = {
        let controller = controller.clone();
        let loft = loft.clone();
        tokio::spawn(async move { controller.select_thread(&loft).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let rows = controller.select_thread(&cabin).await.unwrap();
    assert_eq!(bodies(&rows), vec!["Cabin message"]);

    let err = slow.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Superseded);
    assert_eq!(bodies(&controller.messages().await), vec!["Cabin message"]);
    assert_eq!(
        controller.status().await.selection,
        Selection::Loaded { thread_id: cabin }
    );
}

#[tokio::test]
async fn test_failed_load_keeps_previous_messages() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;

    let controller = guest_session(&store).await;
    controller.select_thread(&t).await.unwrap();

    store.fail_messages.store(true, Ordering::SeqCst);
    let err = controller.select_thread(&t).await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(controller.status().await.selection, Selection::Failed { .. }));
    assert_eq!(bodies(&controller.messages().await), vec!["Welcome!"]);
}

#[tokio::test]
async fn test_refresh_failure_keeps_last_list() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;
    let controller = guest_session(&store).await;

    store.fail_threads.store(true, Ordering::SeqCst);
    let err = controller.refresh_threads().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(controller.threads(&ThreadFilter::default()).await.len(), 1);
    assert!(controller.status().await.threads_error.is_some());

    store.fail_threads.store(false, Ordering::SeqCst);
    controller.refresh_threads().await.unwrap();
    assert!(controller.status().await.threads_error.is_none());
}

#[tokio::test]
async fn test_incoming_message_moves_thread_to_top() {
    let store = Arc::new(ScriptedStore::new());
    let loft = seed_booking(&store, "bk1", "p1", "Beach Loft");
    let cabin = seed_booking(&store, "bk2", "p2", "Mountain Cabin");
    host_says(&store, &cabin, "Cabin details").await;
    host_says(&store, &loft, "Loft details").await;

    let controller = guest_session(&store).await;
    assert_eq!(controller.mark_all_read().await, 2);
    let badge = controller.badge();
    assert_eq!(badge.current(), 0);

    host_says(&store, &cabin, "Is parking included?").await;

    let cabin_id = cabin.as_str();
    assert!(
        wait_for(WAIT, &controller, |c| async move {
            let threads = c.threads(&ThreadFilter::default()).await;
            threads.first().map_or(false, |t| t.id == cabin_id && t.unread_count == 1)
        })
        .await
    );
    assert_eq!(badge.current(), 1);
    assert_eq!(
        controller.thread(&loft).await.unwrap().unread_count,
        0,
        "other threads keep their read state"
    );
}

#[tokio::test]
async fn test_incoming_message_in_open_thread_stays_read() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;

    let controller = guest_session(&store).await;
    controller.select_thread(&t).await.unwrap();
    controller.set_draft(&t, "Looking forward").await;

    host_says(&store, &t, "Door code is 4321").await;

    assert!(
        wait_for(WAIT, &controller, |c| async move { c.messages().await.len() == 2 }).await
    );
    assert_eq!(
        bodies(&controller.messages().await),
        vec!["Welcome!", "Door code is 4321"]
    );
    assert_eq!(controller.thread(&t).await.unwrap().unread_count, 0);
    assert_eq!(controller.unread_total().await, 0);
    assert_eq!(controller.draft(&t).await, "Looking forward");

    assert!(
        wait_for(WAIT, &*store, |s| async move { s.count_unread(GUEST).await.unwrap() == 0 }).await
    );
}

#[tokio::test]
async fn test_sending_clears_draft() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    let controller = guest_session(&store).await;

    controller.set_draft(&t, "Hello").await;
    controller.send_message(&t, "Hello").await.unwrap();
    assert_eq!(controller.draft(&t).await, "");
}

#[tokio::test]
async fn test_own_messages_never_count_as_unread() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    let controller = guest_session(&store).await;

    controller.send_message(&t, "Hi, quick question").await.unwrap();
    controller.refresh_threads().await.unwrap();

    let thread = controller.thread(&t).await.unwrap();
    assert_eq!(thread.unread_count, 0);
    assert_eq!(thread.counterparty_name, "Hank Host");
    assert_eq!(controller.unread_total().await, 0);
}

#[tokio::test]
async fn test_mark_all_read_zeroes_everything_at_once() {
    let store = Arc::new(ScriptedStore::new());
    let loft = seed_booking(&store, "bk1", "p1", "Beach Loft");
    let cabin = seed_booking(&store, "bk2", "p2", "Mountain Cabin");
    host_says(&store, &loft, "Loft details").await;
    host_says(&store, &cabin, "Cabin details").await;
    host_says(&store, &cabin, "Also, firewood").await;

    let controller = guest_session(&store).await;
    assert_eq!(controller.unread_total().await, 3);

    assert_eq!(controller.mark_all_read().await, 2);
    assert_eq!(controller.unread_total().await, 0);
    assert_eq!(controller.badge().current(), 0);
    assert!(controller.threads(&ThreadFilter::unread()).await.is_empty());

    // Still zero after a re-fetch, even before the server flags land
    controller.refresh_threads().await.unwrap();
    assert_eq!(controller.unread_total().await, 0);

    assert!(
        wait_for(WAIT, &*store, |s| async move { s.count_unread(GUEST).await.unwrap() == 0 }).await
    );
    assert_eq!(controller.server_unread_total().await.unwrap(), 0);
}

#[tokio::test]
async fn test_search_and_filter() {
    let store = Arc::new(ScriptedStore::new());
    let loft = seed_booking(&store, "bk1", "p1", "Beach Loft");
    let cabin = seed_booking(&store, "bk2", "p2", "Mountain Cabin");
    host_says(&store, &loft, "Towels are in the closet").await;
    host_says(&store, &cabin, "Snow chains recommended").await;

    let controller = guest_session(&store).await;
    controller.select_thread(&loft).await.unwrap();

    let ids = |threads: Vec<inbox_core::Thread>| threads.into_iter().map(|t| t.id).collect::<Vec<_>>();
    assert_eq!(ids(controller.threads(&ThreadFilter::matching("cabin")).await), vec![cabin.clone()]);
    assert_eq!(ids(controller.threads(&ThreadFilter::matching("TOWELS")).await), vec![loft.clone()]);
    assert_eq!(ids(controller.threads(&ThreadFilter::unread()).await), vec![cabin.clone()]);
    assert_eq!(controller.threads(&ThreadFilter::matching("hank")).await.len(), 2);
}

#[tokio::test]
async fn test_archive_hides_until_new_message() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Thanks for staying!").await;

    let controller = guest_session(&store).await;
    controller.select_thread(&t).await.unwrap();
    controller.archive_thread(&t).await.unwrap();

    assert!(controller.thread(&t).await.is_none());
    assert_eq!(controller.status().await.selection, Selection::Idle);
    controller.refresh_threads().await.unwrap();
    assert!(controller.thread(&t).await.is_none());

    host_says(&store, &t, "You left a charger behind").await;
    let tid = t.as_str();
    assert!(
        wait_for(WAIT, &controller, |c| async move {
            c.thread(tid).await.map_or(false, |t| t.unread_count == 1)
        })
        .await
    );

    let err = controller.archive_thread("bk9:p9:guest:host").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_read_markers_survive_broken_storage() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome!").await;

    let dir = tempfile::TempDir::new().unwrap();
    // A file where the database directory should be
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"not a directory").unwrap();

    let controller = ConversationController::new(
        store.clone(),
        ReadStateCache::with_storage(&blocked),
        &test_config(GUEST),
    );
    controller.start().await.unwrap();
    assert!(controller.status().await.read_state_degraded);

    controller.select_thread(&t).await.unwrap();
    controller.refresh_threads().await.unwrap();
    assert_eq!(controller.unread_total().await, 0);
}

#[tokio::test]
async fn test_empty_inbox() {
    let store = Arc::new(ScriptedStore::new());
    let controller = guest_session(&store).await;

    assert!(controller.threads(&ThreadFilter::default()).await.is_empty());
    assert_eq!(controller.unread_total().await, 0);
    assert_eq!(controller.badge().current(), 0);
    assert_eq!(controller.server_unread_total().await.unwrap(), 0);
    assert_eq!(controller.mark_all_read().await, 0);
    assert!(controller.threads(&ThreadFilter::unread()).await.is_empty());
}

#[tokio::test]
async fn test_confirmed_send_survives_reselect_that_read_before_it() {
    let store = Arc::new(ScriptedStore::new());
    let t = seed_booking(&store, "bk1", "p1", "Beach Loft");
    host_says(&store, &t, "Welcome").await;
    let controller = guest_session(&store).await;
    controller.select_thread(&t).await.unwrap();

    store.read_before_delay.store(true, Ordering::SeqCst);
    store.set_messages_delay(&t, Duration::from_millis(200));
    let reselect = {
        let controller = controller.clone();
        let t = t.clone();
        tokio::spawn(async move { controller.select_thread(&t).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sent = controller.send_message(&t, "See you soon").await.unwrap();
    let view = reselect.await.unwrap().unwrap();
    assert_eq!(bodies(&view), vec!["Welcome", "See you soon"]);

    let rows = controller.messages().await;
    assert_eq!(bodies(&rows), vec!["Welcome", "See you soon"]);
    assert_eq!(
        rows[1].delivery,
        Delivery::Confirmed {
            server_id: sent.id.clone()
        }
    );
    assert!(controller.outbox().await.is_empty());
}

#[tokio::test]
async fn test_confirmed_send_survives_thread_refresh_that_read_before_it() {
    let store = Arc::new(ScriptedStore::new());
    let loft = seed_booking(&store, "bk1", "p1", "Beach Loft");
    let harbor = seed_booking(&store, "bk2", "p2", "Harbor House");
    host_says(&store, &loft, "Welcome").await;
    let controller = guest_session(&store).await;
    assert!(controller.thread(&harbor).await.is_none());

    store.read_before_delay.store(true, Ordering::SeqCst);
    store.set_threads_delay(Duration::from_millis(200));
    let refresh = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.refresh_threads().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reply = controller.send_message(&loft, "See you soon").await.unwrap();
    let first = controller.send_message(&harbor, "Is parking included?").await.unwrap();
    refresh.await.unwrap().unwrap();

    let row = controller.thread(&loft).await.unwrap();
    assert_eq!(row.last_message, "See you soon");
    assert_eq!(row.last_message_id, reply.id);
    let created = controller.thread(&harbor).await.unwrap();
    assert_eq!(created.last_message_id, first.id);
    assert_eq!(created.property_title, "");

    // An up-to-date list takes over, with the real booking details
    store.read_before_delay.store(false, Ordering::SeqCst);
    store.set_threads_delay(Duration::ZERO);
    controller.refresh_threads().await.unwrap();
    assert_eq!(controller.thread(&loft).await.unwrap().last_message_id, reply.id);
    let created = controller.thread(&harbor).await.unwrap();
    assert_eq!(created.property_title, "Harbor House");
    assert_eq!(created.counterparty_name, "Hank Host");
    assert_eq!(controller.threads(&ThreadFilter::default()).await.len(), 2);
}
