use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use metrics::counter;
use shared::config::server::RealtimeConfig;
use shared::models::{ChatStreamEvent, ConnectedPayload};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Addressing key for a push stream: a chat room's participant set or
/// a single user's own sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Chat(Uuid),
    User(Uuid),
}

#[derive(Debug)]
struct Entry {
    user_id: Uuid,
    scope: Scope,
    sender: mpsc::Sender<ChatStreamEvent>,
    connected_at: Instant,
    /// Refreshed on every successful push, including heartbeats.
    last_push: Instant,
}

/// One live push stream as handed to the SSE handler.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<ChatStreamEvent>,
}

/// Owned registry of live push connections. A user may hold several
/// concurrent handles (multiple tabs, multiple chats). The entry map is
/// the only mutable state shared across handler tasks; critical
/// sections stay short and every channel write is a non-blocking
/// `try_send`.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<Uuid, Entry>>,
    capacity: usize,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
    liveness_timeout: Duration,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(config: &RealtimeConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            capacity: config.channel_capacity.max(1),
            heartbeat_interval: Duration::from_secs(config.heartbeat_seconds.max(1)),
            sweep_interval: Duration::from_secs(config.sweep_seconds.max(1)),
            liveness_timeout: Duration::from_secs(config.liveness_timeout_seconds.max(1)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns the heartbeat and sweep loops. Tests drive
    /// [`heartbeat_once`](Self::heartbeat_once) and
    /// [`sweep_once`](Self::sweep_once) directly instead.
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = interval.tick() => registry.heartbeat_once(),
                }
            }
        });

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.sweep_interval);
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = interval.tick() => registry.sweep_once(),
                }
            }
        });
    }

    /// Stops the heartbeat/sweep loops and drops every live entry,
    /// closing the client streams.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut guard = self.entries.lock().expect("registry mutex poisoned");
        let count = guard.len();
        guard.clear();
        if count > 0 {
            info!(connections = count, "registry shutdown closed live connections");
        }
    }

    /// Opens a new push stream for `user_id` under `scope`. The
    /// `connected` acknowledgement is the first event on the channel.
    pub fn register(&self, user_id: Uuid, scope: Scope) -> ConnectionHandle {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.capacity);

        let _ = sender.try_send(ChatStreamEvent::Connected {
            payload: ConnectedPayload { connection_id: id },
        });

        let now = Instant::now();
        let entry = Entry {
            user_id,
            scope,
            sender,
            connected_at: now,
            last_push: now,
        };

        let mut guard = self.entries.lock().expect("registry mutex poisoned");
        guard.insert(id, entry);
        counter!("studyhall_connections_opened_total").increment(1);
        debug!(%user_id, connection = %id, ?scope, "registered push stream");

        ConnectionHandle { id, receiver }
    }

    /// Removes a connection; safe to call for an already-removed id.
    /// Called synchronously when the client stream is dropped.
    pub fn unregister(&self, connection_id: Uuid) {
        let removed = {
            let mut guard = self.entries.lock().expect("registry mutex poisoned");
            guard.remove(&connection_id)
        };
        if let Some(entry) = removed {
            counter!("studyhall_connections_closed_total").increment(1);
            debug!(
                user_id = %entry.user_id,
                connection = %connection_id,
                age_secs = entry.connected_at.elapsed().as_secs(),
                "unregistered push stream"
            );
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.entries.lock().expect("registry mutex poisoned").len()
    }

    /// Fans `event` out to every live connection matching `scope`,
    /// skipping the originating user when given. Best effort, at most
    /// once: a per-connection failure removes only that connection and
    /// never aborts the rest of the fan-out.
    pub fn broadcast(&self, scope: Scope, event: &ChatStreamEvent, exclude_user: Option<Uuid>) {
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        let mut dead = Vec::new();

        {
            let mut guard = self.entries.lock().expect("registry mutex poisoned");
            let now = Instant::now();
            for (id, entry) in guard.iter_mut() {
                if entry.scope != scope {
                    continue;
                }
                if exclude_user.is_some_and(|user| user == entry.user_id) {
                    continue;
                }
                match entry.sender.try_send(event.clone()) {
                    Ok(()) => {
                        entry.last_push = now;
                        delivered += 1;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow consumer: drop the event, keep the
                        // connection. The catch-up poller repairs the
                        // gap; the sweep evicts it if it never drains.
                        dropped += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
            for id in &dead {
                guard.remove(id);
            }
        }

        counter!("studyhall_events_delivered_total", "event" => event.name())
            .increment(delivered);
        if dropped > 0 {
            counter!("studyhall_events_dropped_total", "event" => event.name())
                .increment(dropped);
        }
        if !dead.is_empty() {
            counter!("studyhall_connections_closed_total").increment(dead.len() as u64);
        }
    }

    /// Delivers `event` to every session the user holds, regardless of
    /// scope kind. Used for cross-chat counters and status badges.
    pub fn broadcast_to_user(&self, user_id: Uuid, event: &ChatStreamEvent) {
        let mut dead = Vec::new();
        {
            let mut guard = self.entries.lock().expect("registry mutex poisoned");
            let now = Instant::now();
            for (id, entry) in guard.iter_mut() {
                if entry.user_id != user_id {
                    continue;
                }
                match entry.sender.try_send(event.clone()) {
                    Ok(()) => entry.last_push = now,
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
            for id in &dead {
                guard.remove(id);
            }
        }
    }

    /// One heartbeat pass: push `ping` to every connection; a closed
    /// channel is removed immediately.
    pub fn heartbeat_once(&self) {
        let mut dead = Vec::new();
        {
            let mut guard = self.entries.lock().expect("registry mutex poisoned");
            let now = Instant::now();
            for (id, entry) in guard.iter_mut() {
                match entry.sender.try_send(ChatStreamEvent::Ping) {
                    Ok(()) => entry.last_push = now,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // A full channel does not refresh last_push, so
                        // a consumer that never drains ages out.
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
            for id in &dead {
                guard.remove(id);
            }
        }
        if !dead.is_empty() {
            counter!("studyhall_connections_closed_total").increment(dead.len() as u64);
            debug!(removed = dead.len(), "heartbeat removed closed connections");
        }
    }

    /// One sweep pass: probe with `health_check`, then evict every
    /// connection without a successful push inside the liveness
    /// window. Catches sockets that dropped without a write error.
    pub fn sweep_once(&self) {
        let mut evicted = Vec::new();
        {
            let mut guard = self.entries.lock().expect("registry mutex poisoned");
            let now = Instant::now();
            for (id, entry) in guard.iter_mut() {
                match entry.sender.try_send(ChatStreamEvent::HealthCheck) {
                    Ok(()) => {
                        entry.last_push = now;
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        evicted.push(*id);
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                }
                if now.duration_since(entry.last_push) > self.liveness_timeout {
                    evicted.push(*id);
                }
            }
            for id in &evicted {
                guard.remove(id);
            }
        }
        if !evicted.is_empty() {
            counter!("studyhall_connections_swept_total").increment(evicted.len() as u64);
            info!(evicted = evicted.len(), "sweep evicted dead connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::server::Config;

    fn test_registry() -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(&Config::with_defaults().realtime)
    }

    fn small_registry(capacity: usize) -> Arc<ConnectionRegistry> {
        let mut realtime = Config::with_defaults().realtime;
        realtime.channel_capacity = capacity;
        ConnectionRegistry::new(&realtime)
    }

    #[tokio::test]
    async fn register_emits_connected_acknowledgement() {
        let registry = test_registry();
        let user = Uuid::new_v4();
        let mut handle = registry.register(user, Scope::User(user));

        let event = handle.receiver.recv().await.expect("connected event");
        match event {
            ChatStreamEvent::Connected { payload } => {
                assert_eq!(payload.connection_id, handle.id);
            }
            other => panic!("expected connected, got {other:?}"),
        }
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_excludes_the_originator() {
        let registry = test_registry();
        let chat = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();

        let mut sender_handle = registry.register(sender, Scope::Chat(chat));
        let mut recipient_handle = registry.register(recipient, Scope::Chat(chat));

        // Drain connected acks.
        let _ = sender_handle.receiver.recv().await;
        let _ = recipient_handle.receiver.recv().await;

        registry.broadcast(Scope::Chat(chat), &ChatStreamEvent::Ping, Some(sender));

        let event = recipient_handle.receiver.recv().await.expect("event");
        assert_eq!(event, ChatStreamEvent::Ping);
        assert!(sender_handle.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_is_scoped() {
        let registry = test_registry();
        let chat_a = Uuid::new_v4();
        let chat_b = Uuid::new_v4();
        let user = Uuid::new_v4();

        let mut in_a = registry.register(user, Scope::Chat(chat_a));
        let mut in_b = registry.register(user, Scope::Chat(chat_b));
        let _ = in_a.receiver.recv().await;
        let _ = in_b.receiver.recv().await;

        registry.broadcast(Scope::Chat(chat_a), &ChatStreamEvent::Ping, None);

        assert_eq!(in_a.receiver.recv().await, Some(ChatStreamEvent::Ping));
        assert!(in_b.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_connection_is_removed_without_aborting_fanout() {
        let registry = test_registry();
        let chat = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let alive = Uuid::new_v4();

        let gone_handle = registry.register(gone, Scope::Chat(chat));
        let mut alive_handle = registry.register(alive, Scope::Chat(chat));
        let _ = alive_handle.receiver.recv().await;

        // Simulate a client that dropped its stream.
        drop(gone_handle.receiver);

        registry.broadcast(Scope::Chat(chat), &ChatStreamEvent::Ping, None);

        assert_eq!(alive_handle.receiver.recv().await, Some(ChatStreamEvent::Ping));
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn full_channel_drops_event_but_keeps_connection() {
        let registry = small_registry(1);
        let chat = Uuid::new_v4();
        let user = Uuid::new_v4();

        // Capacity 1 is consumed by the connected ack.
        let handle = registry.register(user, Scope::Chat(chat));

        registry.broadcast(Scope::Chat(chat), &ChatStreamEvent::Ping, None);
        assert_eq!(registry.connection_count(), 1);
        drop(handle);
    }

    #[tokio::test]
    async fn heartbeat_removes_closed_connections() {
        let registry = test_registry();
        let user = Uuid::new_v4();
        let handle = registry.register(user, Scope::User(user));
        drop(handle.receiver);

        registry.heartbeat_once();
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_connections_past_the_liveness_timeout() {
        let registry = small_registry(1);
        let chat = Uuid::new_v4();
        let user = Uuid::new_v4();

        // Never drained: the connected ack keeps the channel full, so
        // no later push succeeds and last_push never refreshes.
        let handle = registry.register(user, Scope::Chat(chat));

        tokio::time::advance(Duration::from_secs(61)).await;
        registry.sweep_once();

        assert_eq!(registry.connection_count(), 0);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_responsive_connections() {
        let registry = test_registry();
        let user = Uuid::new_v4();
        let mut handle = registry.register(user, Scope::User(user));
        let _ = handle.receiver.recv().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        registry.sweep_once();

        // The health_check probe succeeded, so the entry stays.
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(
            handle.receiver.recv().await,
            Some(ChatStreamEvent::HealthCheck)
        );
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_synchronous() {
        let registry = test_registry();
        let user = Uuid::new_v4();
        let handle = registry.register(user, Scope::User(user));

        registry.unregister(handle.id);
        registry.unregister(handle.id);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_all_streams() {
        let registry = test_registry();
        let user = Uuid::new_v4();
        let mut handle = registry.register(user, Scope::User(user));
        let _ = handle.receiver.recv().await;

        registry.shutdown();

        assert_eq!(registry.connection_count(), 0);
        // Senders dropped with the entries, so the stream ends.
        assert_eq!(handle.receiver.recv().await, None);
    }

    #[tokio::test]
    async fn broadcast_to_user_reaches_every_session() {
        let registry = test_registry();
        let user = Uuid::new_v4();
        let chat = Uuid::new_v4();

        let mut tab_one = registry.register(user, Scope::User(user));
        let mut tab_two = registry.register(user, Scope::Chat(chat));
        let _ = tab_one.receiver.recv().await;
        let _ = tab_two.receiver.recv().await;

        registry.broadcast_to_user(user, &ChatStreamEvent::Ping);

        assert_eq!(tab_one.receiver.recv().await, Some(ChatStreamEvent::Ping));
        assert_eq!(tab_two.receiver.recv().await, Some(ChatStreamEvent::Ping));
    }
}
