//! Shared membership used for broadcast fan-out.
//!
//! The registry never writes to sockets itself. Each member is reached through
//! the sending side of its session's outbound queue, so broadcasting only
//! performs non-blocking `try_send` calls while the lock is held. Joins and
//! departures combine the membership change with the matching notice under
//! one lock, which keeps every broadcast consistent with the membership it saw.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

pub type SessionId = u64;

/// The registry's view of a session: its name and a way to reach it.
#[derive(Debug, Clone)]
pub struct Member {
    name: String,
    outbound: mpsc::Sender<String>,
}

impl Member {
    pub fn new(name: impl Into<String>, outbound: mpsc::Sender<String>) -> Self {
        Self {
            name: name.into(),
            outbound,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, text: &str) -> Delivery {
        match self.outbound.try_send(text.to_string()) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Disconnected,
        }
    }
}

/// Outcome of queueing one message for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The recipient's queue is full; this message is skipped for it.
    Dropped,
    /// The recipient's writer is gone; it gets evicted.
    Disconnected,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: Vec<SessionId>,
}

impl BroadcastReport {
    fn record(&mut self, id: SessionId, delivery: Delivery) {
        match delivery {
            Delivery::Sent => self.delivered += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Disconnected => self.evicted.push(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    Full { capacity: usize },
}

pub struct Registry {
    members: Mutex<BTreeMap<SessionId, Member>>,
    capacity: Option<usize>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Creates a registry that refuses joins beyond `capacity` members.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            members: Mutex::new(BTreeMap::new()),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn add(&self, id: SessionId, member: Member) {
        self.members.lock().await.insert(id, member);
    }

    /// Removes `id` if present. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: SessionId) -> Option<Member> {
        self.members.lock().await.remove(&id)
    }

    pub async fn size(&self) -> usize {
        self.members.lock().await.len()
    }

    /// Queues `text` for every member except `exclude`.
    ///
    /// Members whose queue is closed are removed before the lock is released.
    pub async fn broadcast(&self, text: &str, exclude: Option<SessionId>) -> BroadcastReport {
        let mut members = self.members.lock().await;
        fan_out(&mut members, text, exclude)
    }

    /// Admits a member and announces it to everyone else.
    ///
    /// The welcome is built from the member count after insertion and queued to
    /// the joiner before the lock is released, so it precedes any broadcast the
    /// joiner can observe. Returns that member count.
    pub async fn join<F>(
        &self,
        id: SessionId,
        member: Member,
        notice: &str,
        welcome: F,
    ) -> Result<usize, JoinError>
    where
        F: FnOnce(usize) -> String,
    {
        let mut members = self.members.lock().await;
        if let Some(capacity) = self.capacity {
            if members.len() >= capacity {
                return Err(JoinError::Full { capacity });
            }
        }

        let report = fan_out(&mut members, notice, None);
        log_report(&report);

        let online = members.len() + 1;
        if member.deliver(&welcome(online)) != Delivery::Sent {
            warn!(session = id, "welcome could not be queued");
        }
        members.insert(id, member);
        Ok(online)
    }

    /// Removes `id` (if still present) and tells the remaining members.
    pub async fn depart(&self, id: SessionId, notice: &str) -> Option<Member> {
        let mut members = self.members.lock().await;
        let removed = members.remove(&id);
        let report = fan_out(&mut members, notice, None);
        log_report(&report);
        removed
    }

    /// Drops every member, returning how many were registered.
    pub async fn close_all(&self) -> usize {
        let mut members = self.members.lock().await;
        let count = members.len();
        members.clear();
        count
    }
}

fn fan_out(
    members: &mut BTreeMap<SessionId, Member>,
    text: &str,
    exclude: Option<SessionId>,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for (&id, member) in members.iter() {
        if Some(id) == exclude {
            continue;
        }
        report.record(id, member.deliver(text));
    }

    for id in &report.evicted {
        if let Some(member) = members.remove(id) {
            debug!(session = id, name = member.name(), "evicted disconnected member");
        }
    }
    report
}

fn log_report(report: &BroadcastReport) {
    if report.dropped > 0 || !report.evicted.is_empty() {
        debug!(
            dropped = report.dropped,
            evicted = report.evicted.len(),
            "notice not delivered to every member"
        );
    }
}
