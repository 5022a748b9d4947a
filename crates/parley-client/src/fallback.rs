//! Polling fallback for when the live channel cannot be opened.
//!
//! A background task re-queries presence and every conversation's newest
//! messages on a fixed interval and turns the differences into the same
//! [`ServerEvent`]s the live channel would have delivered. Only arrivals and
//! presence changes are synthesized; edits, reactions and typing are not
//! visible through polling.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parley_core::model::{PageCursor, Presence, PresenceSnapshot};
use parley_core::{ConversationId, UserId};
use parley_sync::{ClientEvent, ServerEvent};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::errors::{ClientError, Result};
use crate::rest::RestClient;

/// Messages fetched per request while catching up.
const CATCH_UP_PAGE: usize = 100;

/// Shortest delay between polls.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// REST-backed stand-in for the live channel.
pub struct PollingChannel {
    rest: RestClient,
    task: JoinHandle<()>,
}

impl PollingChannel {
    /// Start polling every `interval` (at least [`MIN_POLL_INTERVAL`]),
    /// sending synthesized events to `events`.
    pub fn start(
        rest: RestClient,
        interval: Duration,
        events: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let poller = Poller {
            rest: rest.clone(),
            events,
            cursors: HashMap::new(),
            primed: false,
            announced: None,
            names: HashMap::new(),
        };
        let task = tokio::spawn(poller.run(interval.max(MIN_POLL_INTERVAL)));
        Self { rest, task }
    }

    /// Carry out an event through the REST API.
    ///
    /// Room membership is implicit because every conversation is polled.
    /// Typing and call events need the live channel.
    pub async fn send(&self, event: &ClientEvent) -> Result<Value> {
        match event {
            ClientEvent::JoinRoom { .. } | ClientEvent::LeaveRoom { .. } => Ok(Value::Null),
            ClientEvent::SendMessage {
                conversation_id,
                content,
                kind,
                reply_to,
            } => {
                let message = self
                    .rest
                    .send_message(conversation_id, content, *kind, reply_to.as_ref())
                    .await?;
                Ok(serde_json::to_value(message)?)
            }
            ClientEvent::AddReaction { message_id, emoji } => {
                self.rest.add_reaction(message_id, emoji).await?;
                Ok(Value::Null)
            }
            ClientEvent::RemoveReaction { message_id } => {
                let removed = self.rest.remove_reaction(message_id).await?;
                Ok(json!({ "removed": removed }))
            }
            ClientEvent::MarkRead {
                conversation_id,
                message_ids,
            } => {
                let marked = self.rest.mark_read(conversation_id, message_ids).await?;
                Ok(json!({ "marked": marked }))
            }
            ClientEvent::FriendRequestSent {
                target_user_id,
                payload,
            } => {
                let request = self
                    .rest
                    .send_friend_request(target_user_id, payload.as_ref())
                    .await?;
                Ok(serde_json::to_value(request)?)
            }
            ClientEvent::FriendRequestResponded {
                target_user_id,
                response,
                payload,
            } => {
                self.rest
                    .respond_friend_request(target_user_id, *response, payload.as_ref())
                    .await?;
                Ok(Value::Null)
            }
            other => Err(ClientError::LiveOnly(other.kind())),
        }
    }

    /// Whether the polling task has stopped.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollingChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Poller {
    rest: RestClient,
    events: mpsc::Sender<ServerEvent>,
    /// Highest `seq` delivered per conversation.
    cursors: HashMap<ConversationId, u64>,
    /// Set after the first message poll has seeded the cursors.
    primed: bool,
    /// Last presence seen per friend; `None` until the first presence poll.
    announced: Option<HashMap<UserId, bool>>,
    names: HashMap<UserId, String>,
}

impl Poller {
    async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let _ = ticker.tick().await;
            match self.poll_once().await {
                Ok(()) => {}
                Err(PollError::Stopped) => break,
                Err(PollError::Client(e)) => warn!(error = %e, "poll failed"),
            }
        }
        debug!("poller stopped");
    }

    async fn poll_once(&mut self) -> std::result::Result<(), PollError> {
        let snapshot = self.rest.presence().await?;
        self.emit_presence(snapshot).await?;
        self.poll_messages().await
    }

    async fn emit_presence(
        &mut self,
        snapshot: PresenceSnapshot,
    ) -> std::result::Result<(), PollError> {
        for user in &snapshot.online {
            let _ = self.names.insert(user.id.clone(), user.name.clone());
        }
        let Some(previous) = self.announced.as_ref() else {
            self.announced = Some(presence_map(&snapshot.friends));
            return self.emit(ServerEvent::OnlineUsers {
                users: snapshot.online,
            })
            .await;
        };

        let changes = presence_changes(previous, &snapshot.friends);
        self.announced = Some(presence_map(&snapshot.friends));
        for change in changes {
            let name = self
                .names
                .get(&change.user_id)
                .cloned()
                .unwrap_or_else(|| change.user_id.to_string());
            let event = if change.is_online {
                ServerEvent::FriendOnline {
                    user_id: change.user_id,
                    name,
                }
            } else {
                ServerEvent::FriendOffline {
                    user_id: change.user_id,
                    name,
                    last_seen: change.last_seen.unwrap_or_else(Utc::now),
                }
            };
            self.emit(event).await?;
        }
        Ok(())
    }

    async fn poll_messages(&mut self) -> std::result::Result<(), PollError> {
        let conversations = self.rest.conversations().await?;
        for conversation in conversations {
            let id = conversation.id;
            let after = match self.cursors.get(&id) {
                Some(seq) => *seq,
                None if !self.primed => {
                    // History that existed before polling began is not news.
                    let latest = self
                        .rest
                        .messages(&id, PageCursor::Latest, Some(1))
                        .await?;
                    let seq = latest.messages.last().map_or(0, |m| m.seq);
                    let _ = self.cursors.insert(id, seq);
                    continue;
                }
                None => 0,
            };
            self.catch_up(id, after).await?;
        }
        self.primed = true;
        Ok(())
    }

    async fn catch_up(
        &mut self,
        id: ConversationId,
        mut after: u64,
    ) -> std::result::Result<(), PollError> {
        loop {
            let page = self
                .rest
                .messages(&id, PageCursor::After(after), Some(CATCH_UP_PAGE))
                .await?;
            for message in page.messages {
                after = after.max(message.seq);
                let _ = self.cursors.insert(id.clone(), after);
                self.emit(ServerEvent::NewMessage {
                    conversation_id: id.clone(),
                    message,
                })
                .await?;
            }
            if !page.has_more {
                let _ = self.cursors.entry(id).or_insert(after);
                return Ok(());
            }
        }
    }

    async fn emit(&self, event: ServerEvent) -> std::result::Result<(), PollError> {
        self.events.send(event).await.map_err(|_| PollError::Stopped)
    }
}

enum PollError {
    /// The event receiver was dropped.
    Stopped,
    Client(ClientError),
}

impl From<ClientError> for PollError {
    fn from(e: ClientError) -> Self {
        Self::Client(e)
    }
}

fn presence_map(friends: &[Presence]) -> HashMap<UserId, bool> {
    friends
        .iter()
        .map(|p| (p.user_id.clone(), p.is_online))
        .collect()
}

/// Friends whose online state differs from `previous`.
///
/// A friend not seen before counts as a change only when online.
fn presence_changes(previous: &HashMap<UserId, bool>, current: &[Presence]) -> Vec<Presence> {
    current
        .iter()
        .filter(|p| previous.get(&p.user_id).copied().unwrap_or(false) != p.is_online)
        .cloned()
        .collect()
}
