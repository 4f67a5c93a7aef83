use chrono::{Duration, Utc};

use wabridge_core::jid::Jid;
use wabridge_core::model::{Chat, Message, MessageKind, Reaction};

use super::Store;

async fn test_store() -> Store {
    Store::open_in_memory().await.unwrap()
}

fn chat_a() -> Jid {
    "A@s.whatsapp.net".parse().unwrap()
}

fn sender() -> Jid {
    "15550001111@s.whatsapp.net".parse().unwrap()
}

fn inbound(id: &str, text: &str) -> Message {
    Message::text(id, chat_a(), sender(), text)
}

fn outbound(id: &str, text: &str) -> Message {
    let mut msg = Message::text(id, chat_a(), sender(), text);
    msg.is_from_me = true;
    msg
}

#[tokio::test]
async fn ingest_is_idempotent() {
    let store = test_store().await;
    let msg = inbound("M1", "one");

    // Redeliveries across reconnects must leave exactly one row.
    assert!(store.ingest(&msg).await.unwrap());
    assert!(!store.ingest(&msg).await.unwrap());
    assert!(!store.ingest(&msg).await.unwrap());

    let rows = store.messages().get_by_chat(&chat_a(), 10, 0).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "M1");

    let chat = store.chats().get(&chat_a()).await.unwrap().unwrap();
    assert_eq!(chat.unread_count, 1);
}

#[tokio::test]
async fn ingest_creates_chat_lazily() {
    let store = test_store().await;
    assert!(store.chats().get(&chat_a()).await.unwrap().is_none());

    store.ingest(&inbound("M1", "hello")).await.unwrap();

    let chat = store.chats().get(&chat_a()).await.unwrap().unwrap();
    assert_eq!(chat.last_message_text, "hello");
    assert_eq!(chat.last_message_sender, Some(sender()));
    assert!(chat.last_message_time.is_some());
}

#[tokio::test]
async fn unread_counts_only_inbound_unread_rows() {
    let store = test_store().await;
    store.ingest(&inbound("M1", "a")).await.unwrap();
    store.ingest(&inbound("M2", "b")).await.unwrap();
    store.ingest(&outbound("M3", "c")).await.unwrap();

    let chat = store.chats().get(&chat_a()).await.unwrap().unwrap();
    assert_eq!(chat.unread_count, 2);
}

#[tokio::test]
async fn mark_read_recomputes_unread() {
    let store = test_store().await;
    let group: Jid = "G@g.us".parse().unwrap();
    for id in ["M1", "M2", "M3"] {
        let msg = Message::text(id, group.clone(), sender(), "hi");
        store.ingest(&msg).await.unwrap();
    }
    assert_eq!(
        store.chats().get(&group).await.unwrap().unwrap().unread_count,
        3
    );

    let unread = store
        .mark_read(&group, &["M1".to_string(), "M3".to_string()])
        .await
        .unwrap();
    assert_eq!(unread, 1);

    let rows = store.messages().get_by_chat(&group, 10, 0).await.unwrap();
    for row in rows {
        match row.id.as_str() {
            "M1" | "M3" => assert!(row.is_read),
            "M2" => assert!(!row.is_read),
            other => panic!("unexpected id {other}"),
        }
    }
}

#[tokio::test]
async fn last_message_time_is_monotonic() {
    let store = test_store().await;
    let now = Utc::now();

    let mut newer = inbound("M-new", "newer");
    newer.timestamp = now;
    let mut older = inbound("M-old", "older");
    older.timestamp = now - Duration::seconds(300);

    store.ingest(&newer).await.unwrap();
    // A late-arriving older message must not regress the summary.
    store.ingest(&older).await.unwrap();

    let chat = store.chats().get(&chat_a()).await.unwrap().unwrap();
    assert_eq!(chat.last_message_text, "newer");
}

#[tokio::test]
async fn create_rejects_duplicate_id() {
    let store = test_store().await;
    let msg = inbound("M1", "one");
    store.messages().create(&msg).await.unwrap();
    let err = store.messages().create(&msg).await.unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}

#[tokio::test]
async fn pages_are_newest_first_with_stable_ties() {
    let store = test_store().await;
    let ts = Utc::now();
    for id in ["B", "A", "C"] {
        let mut msg = inbound(id, id);
        msg.timestamp = ts;
        store.ingest(&msg).await.unwrap();
    }
    let mut earlier = inbound("Z", "z");
    earlier.timestamp = ts - Duration::seconds(60);
    store.ingest(&earlier).await.unwrap();

    let rows = store.messages().get_by_chat(&chat_a(), 10, 0).await.unwrap();
    let ids: Vec<&str> = rows.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B", "C", "Z"]);
}

#[tokio::test]
async fn since_query_is_ascending() {
    let store = test_store().await;
    let ts = Utc::now();
    for (i, id) in ["M1", "M2", "M3"].iter().enumerate() {
        let mut msg = inbound(id, id);
        msg.timestamp = ts + Duration::seconds(i as i64);
        store.ingest(&msg).await.unwrap();
    }

    let rows = store
        .messages()
        .get_by_chat_since(&chat_a(), ts + Duration::seconds(1), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = rows.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["M2", "M3"]);
}

#[tokio::test]
async fn search_treats_metacharacters_literally() {
    let store = test_store().await;
    store.ingest(&inbound("M1", "50% off")).await.unwrap();
    store.ingest(&inbound("M2", "100 off")).await.unwrap();
    store.ingest(&inbound("M3", "free_shipping")).await.unwrap();

    let hits = store.messages().search("50%", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, "50% off");

    let hits = store.messages().search("free_s", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, "free_shipping");

    // An underscore must not act as a single-character wildcard.
    let hits = store.messages().search("100_off", 10).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn search_covers_captions() {
    let store = test_store().await;
    let mut msg = inbound("M1", "");
    msg.kind = MessageKind::Image;
    msg.caption = "holiday photo".to_string();
    store.ingest(&msg).await.unwrap();

    let hits = store.messages().search("holiday", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "M1");
}

fn reaction_msg(id: &str, target: &str, emoji: &str) -> Message {
    let mut msg = Message::text(id, chat_a(), sender(), "");
    msg.kind = MessageKind::Reaction;
    msg.reaction = Some(Reaction {
        target_message_id: target.to_string(),
        emoji: emoji.to_string(),
        sender_jid: sender(),
    });
    msg
}

#[tokio::test]
async fn reaction_replaces_prior_from_same_sender() {
    let store = test_store().await;
    store.ingest(&inbound("M1", "hello")).await.unwrap();

    assert!(store.ingest(&reaction_msg("R1", "M1", "👍")).await.unwrap());
    assert!(store.ingest(&reaction_msg("R2", "M1", "❤️")).await.unwrap());

    let rows = store.messages().get_by_chat(&chat_a(), 10, 0).await.unwrap();
    let reactions: Vec<&Message> = rows
        .iter()
        .filter(|m| m.kind == MessageKind::Reaction)
        .collect();
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[0].reaction.as_ref().unwrap().emoji, "❤️");
}

#[tokio::test]
async fn empty_emoji_clears_reaction() {
    let store = test_store().await;
    store.ingest(&inbound("M1", "hello")).await.unwrap();
    store.ingest(&reaction_msg("R1", "M1", "👍")).await.unwrap();

    assert!(!store.ingest(&reaction_msg("R2", "M1", "")).await.unwrap());

    let rows = store.messages().get_by_chat(&chat_a(), 10, 0).await.unwrap();
    assert!(rows.iter().all(|m| m.kind != MessageKind::Reaction));
}

#[tokio::test]
async fn reactions_never_count_as_unread() {
    let store = test_store().await;
    store.ingest(&inbound("M1", "hello")).await.unwrap();
    store.ingest(&reaction_msg("R1", "M1", "👍")).await.unwrap();

    let chat = store.chats().get(&chat_a()).await.unwrap().unwrap();
    assert_eq!(chat.unread_count, 1);
}

#[tokio::test]
async fn self_reaction_is_rejected() {
    let store = test_store().await;
    let err = store.ingest(&reaction_msg("R1", "R1", "👍")).await.unwrap_err();
    assert!(err.to_string().contains("cannot target itself"));
}

#[tokio::test]
async fn upsert_round_trips_all_fields() {
    let store = test_store().await;
    let group: Jid = "120363000000000001@g.us".parse().unwrap();
    let mut chat = Chat::new(group.clone());
    chat.name = "Weekend plans".to_string();
    chat.is_pinned = true;
    chat.is_muted = true;
    chat.unread_count = 4;
    chat.participants = vec![sender(), "15550002222@s.whatsapp.net".parse().unwrap()];

    store.chats().upsert(&chat).await.unwrap();
    let loaded = store.chats().get(&group).await.unwrap().unwrap();
    assert_eq!(loaded.name, "Weekend plans");
    assert!(loaded.is_pinned && loaded.is_muted && !loaded.is_archived);
    assert_eq!(loaded.unread_count, 4);
    assert_eq!(loaded.participants.len(), 2);
}

#[tokio::test]
async fn chat_list_puts_pinned_first() {
    let store = test_store().await;
    store.ingest(&inbound("M1", "a")).await.unwrap();

    let pinned_jid: Jid = "B@s.whatsapp.net".parse().unwrap();
    let mut pinned = Chat::new(pinned_jid.clone());
    pinned.is_pinned = true;
    store.chats().upsert(&pinned).await.unwrap();

    let chats = store.chats().list(10, 0).await.unwrap();
    assert_eq!(chats[0].jid, pinned_jid);
}

#[tokio::test]
async fn delete_chat_cascades_to_messages() {
    let store = test_store().await;
    store.ingest(&inbound("M1", "a")).await.unwrap();
    store.ingest(&inbound("M2", "b")).await.unwrap();

    store.delete_chat(&chat_a()).await.unwrap();

    assert!(store.chats().get(&chat_a()).await.unwrap().is_none());
    assert!(store
        .messages()
        .get_by_chat(&chat_a(), 10, 0)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn update_read_status_is_bulk() {
    let store = test_store().await;
    for id in ["M1", "M2", "M3"] {
        store.ingest(&inbound(id, "x")).await.unwrap();
    }
    let touched = store
        .messages()
        .update_read_status(&["M1".to_string(), "M2".to_string()], true)
        .await
        .unwrap();
    assert_eq!(touched, 2);
}

#[tokio::test]
async fn create_or_ignore_reports_insertion() {
    let store = test_store().await;
    let msg = inbound("M1", "one");
    assert!(store.messages().create_or_ignore(&msg).await.unwrap());
    assert!(!store.messages().create_or_ignore(&msg).await.unwrap());
}

#[tokio::test]
async fn targeted_chat_mutations() {
    let store = test_store().await;
    store.ingest(&inbound("M1", "first")).await.unwrap();

    let ts = Utc::now() + Duration::seconds(10);
    store
        .chats()
        .update_last_message(&chat_a(), ts, "newer text", &sender())
        .await
        .unwrap();
    store.chats().update_unread_count(&chat_a(), 7).await.unwrap();
    store.chats().increment_unread_count(&chat_a()).await.unwrap();

    let chat = store.chats().get(&chat_a()).await.unwrap().unwrap();
    assert_eq!(chat.last_message_text, "newer text");
    assert_eq!(chat.unread_count, 8);
}

#[tokio::test]
async fn unread_invariant_holds_over_mixed_history() {
    let store = test_store().await;
    // Interleave ingests, sends, and read-marks, then reconcile.
    for i in 0..6 {
        store.ingest(&inbound(&format!("in-{i}"), "msg")).await.unwrap();
    }
    store.ingest(&outbound("out-1", "mine")).await.unwrap();
    store
        .mark_read(&chat_a(), &["in-0".to_string(), "in-3".to_string()])
        .await
        .unwrap();
    store.ingest(&inbound("in-6", "late")).await.unwrap();

    let chat = store.chats().get(&chat_a()).await.unwrap().unwrap();
    let rows = store.messages().get_by_chat(&chat_a(), 100, 0).await.unwrap();
    let expected = rows.iter().filter(|m| !m.is_from_me && !m.is_read).count() as i64;
    assert_eq!(chat.unread_count, expected);
}
