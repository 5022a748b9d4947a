//! Delivery of one event to many sessions.

use std::sync::Arc;

use metrics::counter;
use parley_core::{ChatError, SessionId, UserId};
use tracing::{debug, error, warn};

use crate::events::ServerEvent;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL};
use crate::registry::ConnectionRegistry;
use crate::session::Session;

/// Which recipients to skip in a room broadcast.
#[derive(Clone, Copy, Debug)]
pub enum Exclude<'a> {
    /// Deliver to everyone.
    Nobody,
    /// Skip one session (the origin).
    Session(&'a SessionId),
    /// Skip every session of one user.
    User(&'a UserId),
}

/// How a fan-out went. Failures are per recipient and never abort the rest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Frames queued.
    pub delivered: usize,
    /// Recipients whose queue was full or closed, or who disconnected.
    pub failed: usize,
}

impl DeliveryReport {
    fn record(&mut self, ok: bool) {
        if ok {
            self.delivered += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Serializes an event once and queues it to each target session.
#[derive(Clone)]
pub struct Fanout {
    registry: Arc<ConnectionRegistry>,
}

impl Fanout {
    /// Deliver through sessions of `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver to the given sessions, honoring `exclude`.
    pub fn to_sessions(
        &self,
        targets: &[SessionId],
        event: &ServerEvent,
        exclude: Exclude<'_>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(frame) = encode(event) else {
            return report;
        };
        for id in targets {
            if matches!(exclude, Exclude::Session(skip) if skip == id) {
                continue;
            }
            let Some(session) = self.registry.session(id) else {
                // Disconnected between lookup and delivery.
                report.record(false);
                continue;
            };
            if matches!(exclude, Exclude::User(skip) if skip == session.user_id()) {
                continue;
            }
            report.record(deliver(&session, event.kind(), &frame));
        }
        debug!(
            event = event.kind(),
            delivered = report.delivered,
            failed = report.failed,
            "fan-out"
        );
        report
    }

    /// Deliver to every session of each user.
    pub fn to_users(&self, users: &[UserId], event: &ServerEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(frame) = encode(event) else {
            return report;
        };
        for user in users {
            for session in self.registry.sessions_for(user) {
                report.record(deliver(&session, event.kind(), &frame));
            }
        }
        debug!(
            event = event.kind(),
            users = users.len(),
            delivered = report.delivered,
            "user fan-out"
        );
        report
    }

    /// Deliver to one session.
    pub fn to_session(&self, session: &Session, event: &ServerEvent) -> bool {
        encode(event).is_some_and(|frame| deliver(session, event.kind(), &frame))
    }
}

fn encode(event: &ServerEvent) -> Option<Arc<String>> {
    match event.to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(event = event.kind(), error = %e, "failed to serialize event");
            None
        }
    }
}

fn deliver(session: &Session, kind: &'static str, frame: &Arc<String>) -> bool {
    if session.send(Arc::clone(frame)) {
        counter!(DELIVERIES_TOTAL, "event" => kind).increment(1);
        true
    } else {
        counter!(DELIVERY_FAILURES_TOTAL, "event" => kind).increment(1);
        let err = ChatError::TransientDelivery {
            session_id: session.id().clone(),
        };
        warn!(
            session_id = %session.id(),
            user_id = %session.user_id(),
            event = kind,
            dropped = session.drop_count(),
            error = %err,
            "delivery failed"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use parley_core::model::UserProfile;
    use tokio::sync::mpsc;

    use super::*;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            id: UserId::from(id),
            name: id.into(),
            avatar: None,
        }
    }

    fn event() -> ServerEvent {
        ServerEvent::OnlineUsers { users: vec![] }
    }

    #[test]
    fn exclude_session_skips_origin_only() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let a1 = registry.register(profile("a"), tx1).session;
        let a2 = registry.register(profile("a"), tx2).session;
        let fanout = Fanout::new(Arc::clone(&registry));

        let targets = [a1.id().clone(), a2.id().clone()];
        let report = fanout.to_sessions(&targets, &event(), Exclude::Session(a1.id()));
        assert_eq!(report.delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn exclude_user_skips_all_their_sessions() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let a1 = registry.register(profile("a"), tx.clone()).session;
        let a2 = registry.register(profile("a"), tx.clone()).session;
        let b = registry.register(profile("b"), tx).session;
        let fanout = Fanout::new(registry);

        let targets = [a1.id().clone(), a2.id().clone(), b.id().clone()];
        let report = fanout.to_sessions(&targets, &event(), Exclude::User(a1.user_id()));
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 0 });
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn one_full_queue_does_not_block_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let slow = registry.register(profile("slow"), slow_tx).session;
        let fast = registry.register(profile("fast"), fast_tx).session;
        assert!(slow.send(Arc::new("filler".into())));
        let fanout = Fanout::new(registry);

        let targets = [slow.id().clone(), fast.id().clone()];
        let report = fanout.to_sessions(&targets, &event(), Exclude::Nobody);
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 1 });
        assert!(fast_rx.try_recv().is_ok());
        assert_eq!(slow.drop_count(), 1);
    }

    #[test]
    fn unknown_session_counts_as_failed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let fanout = Fanout::new(registry);
        let report = fanout.to_sessions(&[SessionId::from("gone")], &event(), Exclude::Nobody);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn to_users_reaches_every_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let _ = registry.register(profile("a"), tx.clone());
        let _ = registry.register(profile("a"), tx);
        let fanout = Fanout::new(registry);
        let report = fanout.to_users(&[UserId::from("a"), UserId::from("offline")], &event());
        assert_eq!(report.delivered, 2);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }
}
