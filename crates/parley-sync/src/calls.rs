//! Call-signaling coordinator.
//!
//! A call is `pending` until the first invitee answers or the response
//! window closes. The first answer decides the call and is relayed to the
//! inviter exactly once; later answers are recorded but change nothing. At
//! the deadline a still-pending call expires and every invitee who never
//! answered is reported to the inviter as a synthesized decline.
//!
//! Decided and expired calls stay known for one more window so late
//! answers are ignored rather than rejected as unknown.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use parley_core::model::UserProfile;
use parley_core::{CallId, ChatError, ConversationId, Result, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::events::ServerEvent;
use crate::fanout::Fanout;
use crate::metrics::CALLS_EXPIRED_TOTAL;
use crate::timer::{self, Timer};

/// An invitee's answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAnswer {
    /// Join the call.
    Accepted,
    /// Refuse the call.
    Declined,
}

/// Lifecycle of an invitation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Waiting for the first answer.
    Pending,
    /// First answer was an accept.
    Accepted,
    /// First answer was a decline.
    Declined,
    /// Nobody answered in time.
    Expired,
}

impl CallState {
    /// Whether the state can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl From<CallAnswer> for CallState {
    fn from(answer: CallAnswer) -> Self {
        match answer {
            CallAnswer::Accepted => Self::Accepted,
            CallAnswer::Declined => Self::Declined,
        }
    }
}

/// Snapshot of one call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvitation {
    /// Client-chosen call id.
    pub call_id: CallId,
    /// Conversation the call belongs to.
    pub conversation_id: ConversationId,
    /// Who placed the call.
    pub inviter: UserProfile,
    /// Who was invited.
    pub invited: Vec<UserId>,
    /// Free-form call kind (`video`, `audio`).
    pub call_type: String,
    /// Current state.
    pub state: CallState,
    /// End of the response window.
    pub deadline: DateTime<Utc>,
    /// First answer of each invitee.
    pub responses: BTreeMap<UserId, CallAnswer>,
}

/// What [`CallCoordinator::respond`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// This answer decided the call; relay it to the inviter.
    Decided(CallInvitation),
    /// The call was already decided; nothing to relay.
    Ignored(CallInvitation),
}

struct Entry {
    generation: u64,
    invitation: CallInvitation,
    timer: Option<Timer>,
}

/// Owns every live call and its deadline timer.
pub struct CallCoordinator {
    window: Duration,
    fanout: Fanout,
    calls: Mutex<HashMap<CallId, Entry>>,
    generation: AtomicU64,
}

impl CallCoordinator {
    /// Create a coordinator with the given response window.
    pub fn new(window: Duration, fanout: Fanout) -> Arc<Self> {
        Arc::new(Self {
            window,
            fanout,
            calls: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    /// Register a new pending call and arm its deadline.
    ///
    /// The caller has already checked that everyone involved participates
    /// in the conversation.
    pub fn invite(
        self: &Arc<Self>,
        call_id: CallId,
        conversation_id: ConversationId,
        inviter: UserProfile,
        invited: &[UserId],
        call_type: Option<String>,
    ) -> Result<CallInvitation> {
        let mut invited: Vec<UserId> = invited
            .iter()
            .filter(|u| **u != inviter.id)
            .cloned()
            .collect();
        invited.sort();
        invited.dedup();
        if invited.is_empty() {
            return Err(ChatError::validation("a call needs at least one invitee"));
        }

        let mut calls = self.calls.lock();
        if calls.contains_key(&call_id) {
            return Err(ChatError::validation(format!("call {call_id} already exists")));
        }
        let window = chrono::Duration::from_std(self.window)
            .map_err(|e| ChatError::validation(format!("invalid call window: {e}")))?;
        let invitation = CallInvitation {
            call_id: call_id.clone(),
            conversation_id,
            inviter,
            invited,
            call_type: call_type.unwrap_or_else(|| "video".to_owned()),
            state: CallState::Pending,
            deadline: Utc::now() + window,
            responses: BTreeMap::new(),
        };
        let generation = self.next_generation();
        let timer = self.arm(call_id.clone(), generation, self.window);
        let _ = calls.insert(
            call_id.clone(),
            Entry {
                generation,
                invitation: invitation.clone(),
                timer: Some(timer),
            },
        );
        info!(
            %call_id,
            inviter = %invitation.inviter.id,
            invitees = invitation.invited.len(),
            "call invited"
        );
        Ok(invitation)
    }

    /// Record an answer.
    pub fn respond(
        self: &Arc<Self>,
        call_id: &CallId,
        responder: &UserId,
        answer: CallAnswer,
    ) -> Result<Response> {
        let mut calls = self.calls.lock();
        let entry = calls
            .get_mut(call_id)
            .ok_or_else(|| ChatError::not_found("call", call_id))?;
        if !entry.invitation.invited.contains(responder) {
            return Err(ChatError::unauthorized("not invited to this call"));
        }
        let _ = entry
            .invitation
            .responses
            .entry(responder.clone())
            .or_insert(answer);
        if entry.invitation.state.is_terminal() {
            debug!(%call_id, responder = %responder, "late call response ignored");
            return Ok(Response::Ignored(entry.invitation.clone()));
        }
        entry.invitation.state = answer.into();
        // Replacing the timer cancels the deadline; the new one only forgets the call.
        entry.timer = Some(self.arm(call_id.clone(), entry.generation, self.window));
        info!(%call_id, responder = %responder, state = ?entry.invitation.state, "call decided");
        Ok(Response::Decided(entry.invitation.clone()))
    }

    /// Forget a call. Returns its last snapshot, if it was known.
    pub fn end(&self, call_id: &CallId) -> Option<CallInvitation> {
        let entry = self.calls.lock().remove(call_id)?;
        info!(%call_id, "call ended");
        Some(entry.invitation)
    }

    /// Snapshot of a known call.
    pub fn get(&self, call_id: &CallId) -> Option<CallInvitation> {
        self.calls.lock().get(call_id).map(|e| e.invitation.clone())
    }

    /// Number of calls still known.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    /// Whether no call is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn arm(self: &Arc<Self>, call_id: CallId, generation: u64, delay: Duration) -> Timer {
        let coordinator = Arc::downgrade(self);
        timer::schedule(delay, async move {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.on_timer(&call_id, generation);
            }
        })
    }

    fn on_timer(self: &Arc<Self>, call_id: &CallId, generation: u64) {
        let expired = {
            let mut calls = self.calls.lock();
            let Some(entry) = calls.get_mut(call_id) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            if entry.invitation.state.is_terminal() {
                let _ = calls.remove(call_id);
                debug!(%call_id, "call forgotten");
                return;
            }
            entry.invitation.state = CallState::Expired;
            let silent: Vec<UserId> = entry
                .invitation
                .invited
                .iter()
                .filter(|u| !entry.invitation.responses.contains_key(*u))
                .cloned()
                .collect();
            for user in &silent {
                let _ = entry
                    .invitation
                    .responses
                    .insert(user.clone(), CallAnswer::Declined);
            }
            entry.timer = Some(self.arm(call_id.clone(), generation, self.window));
            (entry.invitation.clone(), silent)
        };
        let (invitation, silent) = expired;
        counter!(CALLS_EXPIRED_TOTAL).increment(1);
        info!(%call_id, unanswered = silent.len(), "call expired");
        for user in silent {
            let event = ServerEvent::VideoCallResponseReceived {
                call_id: invitation.call_id.clone(),
                conversation_id: invitation.conversation_id.clone(),
                responded_by: user,
                response: CallAnswer::Declined,
                synthesized: true,
            };
            let _ = self
                .fanout
                .to_users(std::slice::from_ref(&invitation.inviter.id), &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::ConnectionRegistry;

    const WINDOW: Duration = Duration::from_secs(30);

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            id: UserId::from(id),
            name: id.into(),
            avatar: None,
        }
    }

    struct Fixture {
        coordinator: Arc<CallCoordinator>,
        inviter_rx: mpsc::Receiver<Arc<String>>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, inviter_rx) = mpsc::channel(16);
        let _ = registry.register(profile("a"), tx);
        Fixture {
            coordinator: CallCoordinator::new(WINDOW, Fanout::new(registry)),
            inviter_rx,
        }
    }

    fn invite(c: &Arc<CallCoordinator>, invitees: &[&str]) -> CallInvitation {
        let invitees: Vec<UserId> = invitees.iter().map(|u| UserId::from(*u)).collect();
        c.invite(
            CallId::from("k1"),
            ConversationId::from("c1"),
            profile("a"),
            &invitees,
            None,
        )
        .unwrap()
    }

    fn responses(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn first_answer_decides_and_later_ones_are_ignored() {
        let f = fixture();
        let call = invite(&f.coordinator, &["b", "c"]);
        assert_eq!(call.state, CallState::Pending);
        assert_eq!(call.call_type, "video");

        let first = f
            .coordinator
            .respond(&call.call_id, &UserId::from("b"), CallAnswer::Accepted)
            .unwrap();
        assert_matches!(first, Response::Decided(inv) if inv.state == CallState::Accepted);

        let second = f
            .coordinator
            .respond(&call.call_id, &UserId::from("c"), CallAnswer::Declined)
            .unwrap();
        assert_matches!(second, Response::Ignored(inv) if inv.state == CallState::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_expires_with_one_synthesized_decline_per_invitee() {
        let mut f = fixture();
        let call = invite(&f.coordinator, &["b", "c"]);
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;

        let events = responses(&mut f.inviter_rx);
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_eq!(event["type"], "video_call_response_received");
            assert_eq!(event["response"], "declined");
            assert_eq!(event["synthesized"], true);
        }
        assert_eq!(
            f.coordinator.get(&call.call_id).unwrap().state,
            CallState::Expired
        );

        // Late answers after expiry change nothing.
        let late = f
            .coordinator
            .respond(&call.call_id, &UserId::from("b"), CallAnswer::Accepted)
            .unwrap();
        assert_matches!(late, Response::Ignored(inv) if inv.state == CallState::Expired);

        // Forgotten after the retention window.
        tokio::time::sleep(WINDOW * 2).await;
        assert!(f.coordinator.is_empty());
        assert!(responses(&mut f.inviter_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn answer_before_deadline_cancels_expiry() {
        let mut f = fixture();
        let call = invite(&f.coordinator, &["b"]);
        let _ = f
            .coordinator
            .respond(&call.call_id, &UserId::from("b"), CallAnswer::Declined)
            .unwrap();
        tokio::time::sleep(WINDOW * 3).await;
        assert!(responses(&mut f.inviter_rx).is_empty());
        assert!(f.coordinator.get(&call.call_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn end_cancels_deadline() {
        let mut f = fixture();
        let call = invite(&f.coordinator, &["b"]);
        assert!(f.coordinator.end(&call.call_id).is_some());
        assert!(f.coordinator.end(&call.call_id).is_none());
        tokio::time::sleep(WINDOW * 2).await;
        assert!(responses(&mut f.inviter_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invite_rejects_duplicates_and_empty_lists() {
        let f = fixture();
        let _ = invite(&f.coordinator, &["b"]);
        let dup = f.coordinator.invite(
            CallId::from("k1"),
            ConversationId::from("c1"),
            profile("a"),
            &[UserId::from("b")],
            None,
        );
        assert_matches!(dup, Err(ChatError::Validation { .. }));

        let alone = f.coordinator.invite(
            CallId::from("k2"),
            ConversationId::from("c1"),
            profile("a"),
            &[UserId::from("a")],
            None,
        );
        assert_matches!(alone, Err(ChatError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn respond_errors() {
        let f = fixture();
        let call = invite(&f.coordinator, &["b"]);
        assert_matches!(
            f.coordinator
                .respond(&call.call_id, &UserId::from("z"), CallAnswer::Accepted),
            Err(ChatError::Unauthorized { .. })
        );
        assert_matches!(
            f.coordinator
                .respond(&CallId::from("nope"), &UserId::from("b"), CallAnswer::Accepted),
            Err(ChatError::NotFound { entity: "call", .. })
        );
    }
}
