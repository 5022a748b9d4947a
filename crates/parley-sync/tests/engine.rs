//! End-to-end behaviour of the engine over the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_core::model::{
    Conversation, FriendRequest, FriendResponse, Membership, Message, MessageKind, MessagePage,
    NewGroup, NewMessage, PageCursor, Presence, Role, UserProfile,
};
use parley_core::{CallId, ChatError, ConversationId, MessageId, UserId};
use parley_store::{ChatStore, MemoryStore};
use parley_sync::router::GroupDraft;
use parley_sync::{Actor, CallAnswer, ClientEvent, Draft, Session, SyncConfig, SyncEngine};
use serde_json::Value;
use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(1500);
const TYPING: Duration = Duration::from_secs(2);
const CALL_WINDOW: Duration = Duration::from_secs(30);

struct Harness {
    engine: SyncEngine,
    store: Arc<MemoryStore>,
}

struct Client {
    session: Arc<Session>,
    rx: mpsc::Receiver<Arc<String>>,
}

impl Client {
    fn actor(&self) -> Actor {
        Actor::live(&self.session)
    }

    fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn kinds(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .map(|v| v["type"].as_str().unwrap().to_owned())
            .collect()
    }
}

/// Presence settles after an hour here, so it stays out of the way of
/// tests that do not look at it.
fn harness() -> Harness {
    harness_with_debounce(Duration::from_secs(3600))
}

fn harness_with_debounce(presence_debounce: Duration) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let config = SyncConfig {
        typing_window: TYPING,
        call_response_window: CALL_WINDOW,
        presence_debounce,
        ..SyncConfig::default()
    };
    Harness {
        engine: SyncEngine::new(store.clone(), config),
        store,
    }
}

impl Harness {
    async fn user(&self, name: &str) -> UserProfile {
        self.store.create_user(name, None).await.unwrap()
    }

    async fn befriend(&self, a: &UserProfile, b: &UserProfile) {
        let _ = self.store.send_friend_request(&a.id, &b.id).await.unwrap();
        self.store
            .respond_friend_request(&b.id, &a.id, FriendResponse::Accepted)
            .await
            .unwrap();
    }

    async fn direct(&self, a: &UserProfile, b: &UserProfile) -> Conversation {
        self.befriend(a, b).await;
        self.engine
            .router()
            .open_direct_conversation(&Actor::rest(a.clone()), &b.id)
            .await
            .unwrap()
    }

    async fn group(&self, owner: &UserProfile, members: &[&UserProfile]) -> Conversation {
        for member in members {
            self.befriend(owner, member).await;
        }
        self.engine
            .router()
            .create_group_conversation(
                &Actor::rest(owner.clone()),
                GroupDraft {
                    name: "Team".into(),
                    description: None,
                    members: members.iter().map(|m| m.id.clone()).collect(),
                    allow_invites: true,
                },
            )
            .await
            .unwrap()
    }

    async fn connect(&self, user: &UserProfile) -> Client {
        let (session, rx) = self.engine.connect(user.clone()).await;
        let mut client = Client { session, rx };
        assert_eq!(client.kinds(), vec!["online_users"]);
        client
    }

    async fn send(&self, client: &Client, conversation: &ConversationId, text: &str) -> Result<Message, ChatError> {
        self.send_as(&client.actor(), conversation, text).await
    }

    async fn send_as(&self, actor: &Actor, conversation: &ConversationId, text: &str) -> Result<Message, ChatError> {
        self.engine
            .router()
            .send_message(
                actor,
                Draft {
                    conversation_id: conversation.clone(),
                    content: text.into(),
                    kind: MessageKind::Text,
                    reply_to: None,
                },
            )
            .await
    }
}

// ── Messages ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn message_reaches_every_session_including_the_sender() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let mut a = h.connect(&alice).await;
    let mut b1 = h.connect(&bob).await;
    let mut b2 = h.connect(&bob).await;

    let message = h.send(&a, &conv.id, "  hello  ").await.unwrap();
    assert_eq!(message.content, "hello");
    assert_eq!(message.seq, 1);

    for client in [&mut a, &mut b1, &mut b2] {
        let events = client.drain();
        let news: Vec<&Value> = events.iter().filter(|e| e["type"] == "new_message").collect();
        assert_eq!(news.len(), 1);
        assert_eq!(news[0]["message"]["content"], "hello");
    }
}

#[tokio::test(start_paused = true)]
async fn all_recipients_observe_the_same_order() {
    let h = harness();
    let (alice, bob, carol) = (h.user("Alice").await, h.user("Bob").await, h.user("Carol").await);
    h.befriend(&alice, &bob).await;
    h.befriend(&alice, &carol).await;
    let group = h
        .engine
        .router()
        .create_group_conversation(
            &Actor::rest(alice.clone()),
            GroupDraft {
                name: "Trio".into(),
                description: None,
                members: vec![bob.id.clone(), carol.id.clone()],
                allow_invites: true,
            },
        )
        .await
        .unwrap();
    let a = h.connect(&alice).await;
    let b = h.connect(&bob).await;
    let mut c = h.connect(&carol).await;

    let h = Arc::new(h);
    let mut tasks = Vec::new();
    for (actor, prefix) in [(a.actor(), "a"), (b.actor(), "b")] {
        let h = Arc::clone(&h);
        let conv = group.id.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let _ = h.send_as(&actor, &conv, &format!("{prefix}{i}")).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let seqs: Vec<u64> = c
        .drain()
        .into_iter()
        .filter(|e| e["type"] == "new_message")
        .map(|e| e["message"]["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs.len(), 20);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
}

#[tokio::test(start_paused = true)]
async fn non_member_is_rejected_without_a_write() {
    let h = harness();
    let (alice, bob, mallory) = (h.user("Alice").await, h.user("Bob").await, h.user("Mallory").await);
    let conv = h.direct(&alice, &bob).await;
    let mut b = h.connect(&bob).await;
    let m = h.connect(&mallory).await;

    let err = h.send(&m, &conv.id, "hi").await.unwrap_err();
    assert_matches!(err, ChatError::Unauthorized { .. });
    assert!(b.kinds().iter().all(|k| k != "new_message"));
    let page = h.store.messages_page(&conv.id, PageCursor::Latest, 50).await.unwrap();
    assert!(page.messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn non_member_is_unauthorized_before_message_checks() {
    let h = harness();
    let (alice, bob, mallory) = (h.user("Alice").await, h.user("Bob").await, h.user("Mallory").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;
    let m = h.connect(&mallory).await;
    let router = h.engine.router();
    let message = h.send(&a, &conv.id, "gone soon").await.unwrap();
    let _ = router.delete_message(&a.actor(), &message.id).await.unwrap();

    let reply = router
        .send_message(
            &m.actor(),
            Draft {
                conversation_id: conv.id.clone(),
                content: "re".into(),
                kind: MessageKind::Text,
                reply_to: Some(MessageId::from("ghost")),
            },
        )
        .await;
    assert_matches!(reply, Err(ChatError::Unauthorized { .. }));
    assert_matches!(
        router.add_reaction(&m.actor(), &message.id, "👍").await,
        Err(ChatError::Unauthorized { .. })
    );
    assert_matches!(
        router.edit_message(&m.actor(), &message.id, "x").await,
        Err(ChatError::Unauthorized { .. })
    );
    assert_matches!(
        router.delete_message(&m.actor(), &message.id).await,
        Err(ChatError::Unauthorized { .. })
    );

    // Members still get the specific error.
    assert_matches!(
        router.add_reaction(&a.actor(), &message.id, "👍").await,
        Err(ChatError::Validation { .. })
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_content_and_foreign_reply_are_validation_errors() {
    let h = harness();
    let (alice, bob, carol) = (h.user("Alice").await, h.user("Bob").await, h.user("Carol").await);
    let ab = h.direct(&alice, &bob).await;
    let ac = h.direct(&alice, &carol).await;
    let a = h.connect(&alice).await;

    assert_matches!(h.send(&a, &ab.id, "   ").await, Err(ChatError::Validation { .. }));
    let long = "x".repeat(2001);
    assert_matches!(h.send(&a, &ab.id, &long).await, Err(ChatError::Validation { .. }));

    let other = h.send(&a, &ac.id, "elsewhere").await.unwrap();
    let reply = h
        .engine
        .router()
        .send_message(
            &a.actor(),
            Draft {
                conversation_id: ab.id.clone(),
                content: "re".into(),
                kind: MessageKind::Text,
                reply_to: Some(other.id),
            },
        )
        .await;
    assert_matches!(reply, Err(ChatError::Validation { .. }));

    let missing = h.send(&a, &ConversationId::from("nope"), "hi").await;
    assert_matches!(missing, Err(ChatError::NotFound { entity: "conversation", .. }));
}

#[tokio::test(start_paused = true)]
async fn store_outage_aborts_before_fan_out() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;

    h.store.set_unavailable(true);
    let err = h.send(&a, &conv.id, "lost").await.unwrap_err();
    assert_matches!(err, ChatError::StoreUnavailable { .. });
    assert!(b.kinds().iter().all(|k| k != "new_message"));
}

#[tokio::test(start_paused = true)]
async fn edit_and_delete_are_broadcast() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    let message = h.send(&a, &conv.id, "draft").await.unwrap();

    let denied = h.engine.router().edit_message(&b.actor(), &message.id, "hijack").await;
    assert_matches!(denied, Err(ChatError::Unauthorized { .. }));

    let edited = h.engine.router().edit_message(&a.actor(), &message.id, "final").await.unwrap();
    assert_eq!(edited.content, "final");
    assert!(edited.edited_at.is_some());
    let deleted = h.engine.router().delete_message(&a.actor(), &message.id).await.unwrap();
    assert!(deleted.deleted);

    let kinds = b.kinds();
    assert_eq!(kinds, vec!["new_message", "message_edited", "message_deleted"]);
}

// ── Receipts and reactions ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn mark_read_is_idempotent_and_skips_the_origin_session() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let mut a = h.connect(&alice).await;
    let mut b1 = h.connect(&bob).await;
    let mut b2 = h.connect(&bob).await;
    let message = h.send(&a, &conv.id, "read me").await.unwrap();
    let _ = (a.drain(), b1.drain(), b2.drain());

    let ids = vec![message.id.clone()];
    let marked = h.engine.router().mark_read(&b1.actor(), &conv.id, &ids).await.unwrap();
    assert_eq!(marked, ids);
    assert_eq!(a.kinds(), vec!["messages_read"]);
    assert_eq!(b2.kinds(), vec!["messages_read"]);
    assert!(b1.kinds().is_empty());

    let again = h.engine.router().mark_read(&b1.actor(), &conv.id, &ids).await.unwrap();
    assert!(again.is_empty());
    assert!(a.kinds().is_empty());
    assert!(b2.kinds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reactions_replace_and_removal_of_nothing_is_silent() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let mut a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    let message = h.send(&a, &conv.id, "react").await.unwrap();
    let _ = (a.drain(), b.drain());
    let router = h.engine.router();

    router.add_reaction(&b.actor(), &message.id, "👍").await.unwrap();
    router.add_reaction(&b.actor(), &message.id, "🎉").await.unwrap();
    let reactions = h.store.reactions(&message.id).await.unwrap();
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[&bob.id], "🎉");

    assert!(router.remove_reaction(&b.actor(), &message.id).await.unwrap());
    assert!(!router.remove_reaction(&b.actor(), &message.id).await.unwrap());

    let events = a.drain();
    let actions: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "message_reaction")
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["add", "add", "remove"]);
}

#[tokio::test(start_paused = true)]
async fn removing_a_reaction_keeps_other_users_reactions() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;
    let b = h.connect(&bob).await;
    let message = h.send(&a, &conv.id, "vote").await.unwrap();
    let router = h.engine.router();

    router.add_reaction(&a.actor(), &message.id, "👍").await.unwrap();
    router.add_reaction(&b.actor(), &message.id, "🎉").await.unwrap();
    assert_eq!(h.store.reactions(&message.id).await.unwrap().len(), 2);

    assert!(router.remove_reaction(&b.actor(), &message.id).await.unwrap());
    let reactions = h.store.reactions(&message.id).await.unwrap();
    assert_eq!(reactions.len(), 1);
    assert_eq!(reactions[&alice.id], "👍");
}

#[tokio::test(start_paused = true)]
async fn reaction_on_unknown_message_is_not_found() {
    let h = harness();
    let alice = h.user("Alice").await;
    let a = h.connect(&alice).await;
    let err = h
        .engine
        .router()
        .add_reaction(&a.actor(), &MessageId::from("ghost"), "👍")
        .await
        .unwrap_err();
    assert_matches!(err, ChatError::NotFound { entity: "message", .. });
}

// ── Typing ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn typing_excludes_the_typist_and_expires_once() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let a1 = h.connect(&alice).await;
    let mut a2 = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    let router = h.engine.router();

    router.start_typing(&a1.actor(), &conv.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    router.start_typing(&a1.actor(), &conv.id).await.unwrap();
    assert_eq!(b.kinds(), vec!["user_typing"]);

    tokio::time::sleep(TYPING * 5).await;
    assert_eq!(b.kinds(), vec!["user_stopped_typing"]);
    assert!(a2.kinds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sending_a_message_ends_typing() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;

    h.engine.router().start_typing(&a.actor(), &conv.id).await.unwrap();
    let _ = h.send(&a, &conv.id, "done").await.unwrap();
    tokio::time::sleep(TYPING * 3).await;
    assert_eq!(b.kinds(), vec!["user_typing", "new_message", "user_stopped_typing"]);
}

#[tokio::test(start_paused = true)]
async fn removing_a_typing_member_tells_the_rest() {
    let h = harness();
    let (alice, bob, carol) = (h.user("Alice").await, h.user("Bob").await, h.user("Carol").await);
    let group = h.group(&alice, &[&bob, &carol]).await;
    let mut a = h.connect(&alice).await;
    let b = h.connect(&bob).await;
    let mut c = h.connect(&carol).await;
    let router = h.engine.router();

    router.start_typing(&b.actor(), &group.id).await.unwrap();
    assert_eq!(a.kinds(), vec!["user_typing"]);
    let _ = c.drain();

    router.remove_member(&a.actor(), &group.id, &bob.id).await.unwrap();
    assert!(!router.typing().is_typing(&group.id, &bob.id));
    for client in [&mut a, &mut c] {
        let events = client.drain();
        let stopped: Vec<&Value> = events
            .iter()
            .filter(|e| e["type"] == "user_stopped_typing")
            .collect();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0]["userId"], serde_json::json!(bob.id));
        assert_eq!(stopped[0]["name"], "Bob");
    }

    // The cleared state does not expire a second time.
    tokio::time::sleep(TYPING * 3).await;
    assert!(a.kinds().is_empty());
}

// ── Presence ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn presence_is_debounced_and_reaches_friends_only() {
    let h = harness_with_debounce(DEBOUNCE);
    let (alice, bob, stranger) = (h.user("Alice").await, h.user("Bob").await, h.user("Stranger").await);
    h.befriend(&alice, &bob).await;
    let mut b = h.connect(&bob).await;
    let mut s = h.connect(&stranger).await;
    tokio::time::sleep(DEBOUNCE * 2).await;
    let _ = (b.drain(), s.drain());

    let a = h.connect(&alice).await;
    assert!(b.kinds().is_empty());
    tokio::time::sleep(DEBOUNCE * 2).await;
    assert_eq!(b.kinds(), vec!["friend_online"]);
    assert!(s.kinds().is_empty());

    h.engine.disconnect(a.session.id());
    h.engine.disconnect(a.session.id());
    tokio::time::sleep(DEBOUNCE * 2).await;
    assert_eq!(b.kinds(), vec!["friend_offline"]);
    let presence = h.engine.presence(&alice.id).await.unwrap();
    assert!(!presence.is_online);
}

#[tokio::test(start_paused = true)]
async fn second_device_does_not_announce_again() {
    let h = harness_with_debounce(DEBOUNCE);
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    h.befriend(&alice, &bob).await;
    let mut b = h.connect(&bob).await;
    let a1 = h.connect(&alice).await;
    tokio::time::sleep(DEBOUNCE * 2).await;
    let _ = b.drain();

    let a2 = h.connect(&alice).await;
    h.engine.disconnect(a1.session.id());
    tokio::time::sleep(DEBOUNCE * 2).await;
    assert!(b.kinds().is_empty());
    assert!(h.engine.registry().is_online(&alice.id));
    drop(a2);
}

// ── Calls ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn call_first_answer_wins_and_silence_expires() {
    let h = harness();
    let (alice, bob, carol) = (h.user("Alice").await, h.user("Bob").await, h.user("Carol").await);
    h.befriend(&alice, &bob).await;
    h.befriend(&alice, &carol).await;
    let group = h
        .engine
        .router()
        .create_group_conversation(
            &Actor::rest(alice.clone()),
            GroupDraft {
                name: "Call".into(),
                description: None,
                members: vec![bob.id.clone(), carol.id.clone()],
                allow_invites: true,
            },
        )
        .await
        .unwrap();
    let mut a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    let c = h.connect(&carol).await;

    let invite = ClientEvent::CallInvite {
        conversation_id: group.id.clone(),
        call_id: CallId::from("call-1"),
        invited_user_ids: vec![bob.id.clone(), carol.id.clone()],
        call_type: None,
    };
    let _ = h.engine.handle(&a.session, invite).await.unwrap();
    assert_eq!(b.kinds(), vec!["video_call_invitation"]);

    let router = h.engine.router();
    let _ = router
        .respond_to_call(&b.actor(), &CallId::from("call-1"), CallAnswer::Accepted)
        .unwrap();
    let _ = router
        .respond_to_call(&c.actor(), &CallId::from("call-1"), CallAnswer::Declined)
        .unwrap();
    let responses: Vec<Value> = a
        .drain()
        .into_iter()
        .filter(|e| e["type"] == "video_call_response_received")
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["response"], "accepted");

    // A second call nobody answers.
    let invite = ClientEvent::CallInvite {
        conversation_id: group.id.clone(),
        call_id: CallId::from("call-2"),
        invited_user_ids: vec![bob.id.clone()],
        call_type: Some("audio".into()),
    };
    let _ = h.engine.handle(&a.session, invite).await.unwrap();
    tokio::time::sleep(CALL_WINDOW + Duration::from_secs(1)).await;
    let synthesized: Vec<Value> = a
        .drain()
        .into_iter()
        .filter(|e| e["type"] == "video_call_response_received")
        .collect();
    assert_eq!(synthesized.len(), 1);
    assert_eq!(synthesized[0]["synthesized"], true);
    assert_eq!(synthesized[0]["respondedBy"], bob.id.as_str());
}

#[tokio::test(start_paused = true)]
async fn call_invite_to_outsider_is_rejected() {
    let h = harness();
    let (alice, bob, outsider) = (h.user("Alice").await, h.user("Bob").await, h.user("Out").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;
    let err = h
        .engine
        .router()
        .invite_to_call(&a.actor(), &conv.id, CallId::from("k"), &[outsider.id.clone()], None)
        .await
        .unwrap_err();
    assert_matches!(err, ChatError::Validation { .. });
    assert!(h.engine.router().calls().is_empty());
}

// ── Membership ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn direct_conversation_requires_friendship() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let err = h
        .engine
        .router()
        .open_direct_conversation(&Actor::rest(alice.clone()), &bob.id)
        .await
        .unwrap_err();
    assert_matches!(err, ChatError::Unauthorized { .. });
    assert!(h.store.conversations_for_user(&alice.id).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn added_member_is_subscribed_before_the_next_message() {
    let h = harness();
    let (alice, bob, dave) = (h.user("Alice").await, h.user("Bob").await, h.user("Dave").await);
    h.befriend(&alice, &bob).await;
    let group = h
        .engine
        .router()
        .create_group_conversation(
            &Actor::rest(alice.clone()),
            GroupDraft {
                name: "Team".into(),
                description: Some("work".into()),
                members: vec![bob.id.clone()],
                allow_invites: true,
            },
        )
        .await
        .unwrap();
    let a = h.connect(&alice).await;
    let mut d = h.connect(&dave).await;

    let denied = h.engine.router().add_member(&a.actor(), &group.id, &dave.id).await;
    assert_matches!(denied, Err(ChatError::Unauthorized { .. }));

    h.befriend(&alice, &dave).await;
    let _ = h.engine.router().add_member(&a.actor(), &group.id, &dave.id).await.unwrap();
    let _ = h.send(&a, &group.id, "welcome").await.unwrap();

    let events = d.drain();
    let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["new_message", "conversation_updated", "new_message"]);
    assert_eq!(events[0]["message"]["kind"], "system");
    assert_eq!(events[2]["message"]["content"], "welcome");
}

#[tokio::test(start_paused = true)]
async fn removed_member_stops_receiving_and_cannot_send() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    h.befriend(&alice, &bob).await;
    let group = h
        .engine
        .router()
        .create_group_conversation(
            &Actor::rest(alice.clone()),
            GroupDraft {
                name: "Club".into(),
                description: None,
                members: vec![bob.id.clone()],
                allow_invites: false,
            },
        )
        .await
        .unwrap();
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;

    let denied = h.engine.router().remove_member(&b.actor(), &group.id, &alice.id).await;
    assert_matches!(denied, Err(ChatError::Unauthorized { .. }));

    h.engine.router().remove_member(&a.actor(), &group.id, &bob.id).await.unwrap();
    assert!(!h.engine.rooms().is_subscribed(b.session.id(), &group.id));
    assert_eq!(b.kinds(), vec!["conversation_updated"]);

    let _ = h.send(&a, &group.id, "after").await.unwrap();
    assert!(b.kinds().is_empty());
    assert_matches!(h.send(&b, &group.id, "let me in").await, Err(ChatError::Unauthorized { .. }));
}

#[tokio::test(start_paused = true)]
async fn only_the_owner_changes_roles() {
    let h = harness();
    let (alice, bob, carol) = (h.user("Alice").await, h.user("Bob").await, h.user("Carol").await);
    let group = h.group(&alice, &[&bob, &carol]).await;
    let owner = Actor::rest(alice.clone());
    let mut c = h.connect(&carol).await;
    let router = h.engine.router();

    let promoted = router.update_role(&owner, &group.id, &bob.id, Role::Admin).await.unwrap();
    assert_eq!(promoted.role, Role::Admin);
    let kinds = c.kinds();
    assert_eq!(kinds, vec!["new_message", "conversation_updated"]);

    let by_admin = router
        .update_role(&Actor::rest(bob.clone()), &group.id, &carol.id, Role::Admin)
        .await;
    assert_matches!(by_admin, Err(ChatError::Unauthorized { .. }));
    assert_matches!(
        router.update_role(&owner, &group.id, &bob.id, Role::Owner).await,
        Err(ChatError::Validation { .. })
    );
    assert_matches!(
        router.update_role(&owner, &group.id, &alice.id, Role::Member).await,
        Err(ChatError::Validation { .. })
    );

    let (direct, _) = h.store.create_direct_conversation(&alice.id, &carol.id).await.unwrap();
    assert_matches!(
        router.update_role(&owner, &direct.id, &carol.id, Role::Admin).await,
        Err(ChatError::Validation { .. })
    );
    let membership = h.store.membership(&group.id, &bob.id).await.unwrap().unwrap();
    assert_eq!(membership.role, Role::Admin);
}

#[tokio::test(start_paused = true)]
async fn friend_requests_can_be_listed_cancelled_and_friends_removed() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let mut b = h.connect(&bob).await;
    let router = h.engine.router();
    let (ana, ben) = (Actor::rest(alice.clone()), Actor::rest(bob.clone()));

    let _ = router.send_friend_request(&ana, &bob.id, None).await.unwrap();
    let pending = router.pending_friend_requests(&ben).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].from, alice.id);

    router.cancel_friend_request(&ana, &bob.id).await.unwrap();
    assert!(router.pending_friend_requests(&ben).await.unwrap().is_empty());
    assert_eq!(b.kinds(), vec!["friend_request_received", "friend_request_cancelled"]);
    assert_matches!(
        router.cancel_friend_request(&ana, &bob.id).await,
        Err(ChatError::NotFound { .. })
    );

    h.befriend(&alice, &bob).await;
    let friends = router.friends(&ana).await.unwrap();
    let names: Vec<&str> = friends.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["Bob"]);

    router.remove_friend(&ana, &bob.id).await.unwrap();
    assert_eq!(b.kinds(), vec!["friend_removed"]);
    assert!(router.friends(&ben).await.unwrap().is_empty());
    assert_matches!(
        router.remove_friend(&ana, &bob.id).await,
        Err(ChatError::Validation { .. })
    );
}

// ── Frames and sessions ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn frames_are_acked_with_request_id() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;

    let frame = format!(
        r#"{{"id":"r1","type":"send_message","conversationId":"{}","content":"hey"}}"#,
        conv.id
    );
    let ack = h.engine.handle_frame(&a.session, &frame).await.unwrap();
    let value = serde_json::to_value(&ack).unwrap();
    assert_eq!(value["requestId"], "r1");
    assert_eq!(value["success"], true);
    assert_eq!(value["result"]["content"], "hey");

    let silent = format!(r#"{{"type":"typing_stop","conversationId":"{}"}}"#, conv.id);
    assert!(h.engine.handle_frame(&a.session, &silent).await.is_none());

    let bad = h.engine.handle_frame(&a.session, r#"{"id":"r2","type":"nope"}"#).await.unwrap();
    let value = serde_json::to_value(&bad).unwrap();
    assert_eq!(value["success"], false);
    assert_eq!(value["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test(start_paused = true)]
async fn join_and_leave_room_notify_other_members() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;
    let mut b = h.connect(&bob).await;
    let router = h.engine.router();

    assert!(router.leave_room(&a.actor(), &conv.id).unwrap());
    assert!(router.join_room(&a.actor(), &conv.id).await.unwrap());
    assert!(!router.join_room(&a.actor(), &conv.id).await.unwrap());
    assert_eq!(b.kinds(), vec!["user_left_room", "user_joined_room"]);

    let rest = router.join_room(&Actor::rest(alice.clone()), &conv.id).await;
    assert_matches!(rest, Err(ChatError::Validation { .. }));
}

#[tokio::test(start_paused = true)]
async fn disconnect_clears_subscriptions() {
    let h = harness();
    let (alice, bob) = (h.user("Alice").await, h.user("Bob").await);
    let conv = h.direct(&alice, &bob).await;
    let a = h.connect(&alice).await;
    assert!(h.engine.rooms().is_subscribed(a.session.id(), &conv.id));

    h.engine.disconnect(a.session.id());
    assert!(h.engine.rooms().members_of(&conv.id).is_empty());
    assert_eq!(h.engine.session_count(), 0);
    assert!(h.engine.online_users().is_empty());
    let unknown = UserId::from("ghost");
    assert_matches!(h.engine.authenticate(&unknown).await, Err(ChatError::Unauthorized { .. }));
}

#[tokio::test(start_paused = true)]
async fn non_member_never_enters_the_room() {
    let h = harness();
    let (alice, bob, mallory) = (h.user("Alice").await, h.user("Bob").await, h.user("Mallory").await);
    let conv = h.direct(&alice, &bob).await;
    let mut m = h.connect(&mallory).await;
    let router = h.engine.router();

    let subscribed = router.subscribe(m.session.id(), &conv.id).await;
    assert_matches!(subscribed, Err(ChatError::Unauthorized { .. }));
    let joined = router.join_room(&m.actor(), &conv.id).await;
    assert_matches!(joined, Err(ChatError::Unauthorized { .. }));

    assert!(h.engine.rooms().members_of(&conv.id).is_empty());
    assert!(h.engine.rooms().rooms_of(m.session.id()).is_empty());
    assert!(m.kinds().is_empty());
}

// ── Stale conversation lists ────────────────────────────────────────

/// Serves a fixed conversation list, as if it was read just before a
/// membership change.
struct StaleListStore {
    inner: Arc<MemoryStore>,
    listed: Mutex<Option<Vec<Conversation>>>,
}

#[async_trait]
impl ChatStore for StaleListStore {
    async fn create_user(&self, name: &str, avatar: Option<&str>) -> parley_store::Result<UserProfile> {
        self.inner.create_user(name, avatar).await
    }

    async fn user(&self, id: &UserId) -> parley_store::Result<Option<UserProfile>> {
        self.inner.user(id).await
    }

    async fn users(&self, ids: &[UserId]) -> parley_store::Result<Vec<UserProfile>> {
        self.inner.users(ids).await
    }

    async fn set_presence(&self, user: &UserId, online: bool, at: DateTime<Utc>) -> parley_store::Result<()> {
        self.inner.set_presence(user, online, at).await
    }

    async fn presence(&self, user: &UserId) -> parley_store::Result<Presence> {
        self.inner.presence(user).await
    }

    async fn friend_ids(&self, user: &UserId) -> parley_store::Result<Vec<UserId>> {
        self.inner.friend_ids(user).await
    }

    async fn send_friend_request(&self, from: &UserId, to: &UserId) -> parley_store::Result<FriendRequest> {
        self.inner.send_friend_request(from, to).await
    }

    async fn respond_friend_request(
        &self,
        responder: &UserId,
        requester: &UserId,
        response: FriendResponse,
    ) -> parley_store::Result<()> {
        self.inner.respond_friend_request(responder, requester, response).await
    }

    async fn cancel_friend_request(&self, from: &UserId, to: &UserId) -> parley_store::Result<()> {
        self.inner.cancel_friend_request(from, to).await
    }

    async fn remove_friend(&self, user: &UserId, friend: &UserId) -> parley_store::Result<()> {
        self.inner.remove_friend(user, friend).await
    }

    async fn pending_friend_requests(&self, user: &UserId) -> parley_store::Result<Vec<FriendRequest>> {
        self.inner.pending_friend_requests(user).await
    }

    async fn conversation(&self, id: &ConversationId) -> parley_store::Result<Option<Conversation>> {
        self.inner.conversation(id).await
    }

    async fn conversation_members(&self, id: &ConversationId) -> parley_store::Result<Vec<Membership>> {
        self.inner.conversation_members(id).await
    }

    async fn membership(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> parley_store::Result<Option<Membership>> {
        self.inner.membership(conversation, user).await
    }

    async fn conversations_for_user(&self, user: &UserId) -> parley_store::Result<Vec<Conversation>> {
        let listed = self.listed.lock().clone();
        match listed {
            Some(listed) => Ok(listed),
            None => self.inner.conversations_for_user(user).await,
        }
    }

    async fn create_direct_conversation(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> parley_store::Result<(Conversation, bool)> {
        self.inner.create_direct_conversation(a, b).await
    }

    async fn create_group_conversation(&self, group: NewGroup) -> parley_store::Result<Conversation> {
        self.inner.create_group_conversation(group).await
    }

    async fn add_member(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> parley_store::Result<Membership> {
        self.inner.add_member(conversation, user, role).await
    }

    async fn remove_member(&self, conversation: &ConversationId, user: &UserId) -> parley_store::Result<()> {
        self.inner.remove_member(conversation, user).await
    }

    async fn update_role(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        role: Role,
    ) -> parley_store::Result<Membership> {
        self.inner.update_role(conversation, user, role).await
    }

    async fn create_message(&self, message: NewMessage) -> parley_store::Result<Message> {
        self.inner.create_message(message).await
    }

    async fn message(&self, id: &MessageId) -> parley_store::Result<Option<Message>> {
        self.inner.message(id).await
    }

    async fn messages_page(
        &self,
        conversation: &ConversationId,
        cursor: PageCursor,
        limit: usize,
    ) -> parley_store::Result<MessagePage> {
        self.inner.messages_page(conversation, cursor, limit).await
    }

    async fn edit_message(&self, id: &MessageId, content: &str, at: DateTime<Utc>) -> parley_store::Result<Message> {
        self.inner.edit_message(id, content, at).await
    }

    async fn delete_message(&self, id: &MessageId, at: DateTime<Utc>) -> parley_store::Result<Message> {
        self.inner.delete_message(id, at).await
    }

    async fn upsert_reaction(&self, message: &MessageId, user: &UserId, emoji: &str) -> parley_store::Result<()> {
        self.inner.upsert_reaction(message, user, emoji).await
    }

    async fn delete_reaction(&self, message: &MessageId, user: &UserId) -> parley_store::Result<bool> {
        self.inner.delete_reaction(message, user).await
    }

    async fn reactions(&self, message: &MessageId) -> parley_store::Result<BTreeMap<UserId, String>> {
        self.inner.reactions(message).await
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        message_ids: &[MessageId],
    ) -> parley_store::Result<Vec<MessageId>> {
        self.inner.mark_read(conversation, user, message_ids).await
    }

    async fn unread_count(&self, conversation: &ConversationId, user: &UserId) -> parley_store::Result<u64> {
        self.inner.unread_count(conversation, user).await
    }
}

#[tokio::test(start_paused = true)]
async fn connect_with_a_stale_list_skips_conversations_left_since() {
    let inner = Arc::new(MemoryStore::new());
    let store = Arc::new(StaleListStore {
        inner: Arc::clone(&inner),
        listed: Mutex::new(None),
    });
    let engine = SyncEngine::new(store.clone(), SyncConfig::default());
    let alice = inner.create_user("Alice", None).await.unwrap();
    let bob = inner.create_user("Bob", None).await.unwrap();
    let _ = inner.send_friend_request(&alice.id, &bob.id).await.unwrap();
    inner
        .respond_friend_request(&bob.id, &alice.id, FriendResponse::Accepted)
        .await
        .unwrap();
    let (direct, _) = inner.create_direct_conversation(&alice.id, &bob.id).await.unwrap();
    let group = engine
        .router()
        .create_group_conversation(
            &Actor::rest(alice.clone()),
            GroupDraft {
                name: "Team".into(),
                description: None,
                members: vec![bob.id.clone()],
                allow_invites: true,
            },
        )
        .await
        .unwrap();

    let before_removal = inner.conversations_for_user(&bob.id).await.unwrap();
    assert_eq!(before_removal.len(), 2);
    engine
        .router()
        .remove_member(&Actor::rest(alice.clone()), &group.id, &bob.id)
        .await
        .unwrap();
    *store.listed.lock() = Some(before_removal);

    let (session, _rx) = engine.connect(bob.clone()).await;
    assert!(engine.rooms().is_subscribed(session.id(), &direct.id));
    assert!(!engine.rooms().is_subscribed(session.id(), &group.id));
    assert!(engine.rooms().members_of(&group.id).is_empty());
}
