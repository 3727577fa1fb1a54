//! Authoritative map from session-id to agent identity, channel membership
//! and liveness. Generalized from the teacher's `session/manager.rs`
//! (LRU-capped session cache) and `heartbeat/service.rs` (periodic sweep
//! loop) into a single in-memory registry with room-based broadcast.

use crate::bus::{Event, EventBus, EventPayload};
use crate::config::HeartbeatConfig;
use crate::observability::{self, EventKind};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub agent_id: String,
    pub display_name: String,
    pub channels: HashSet<String>,
    pub subscribed_kinds: HashSet<EventKind>,
    pub tool_allow_list: HashSet<String>,
    pub last_heartbeat_ms: i64,
}

impl Session {
    pub fn new(session_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            display_name: String::new(),
            channels: HashSet::new(),
            subscribed_kinds: HashSet::new(),
            tool_allow_list: HashSet::new(),
            last_heartbeat_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn can_call(&self, tool_name: &str) -> bool {
        self.tool_allow_list.is_empty() || self.tool_allow_list.contains(tool_name)
    }
}

/// Session Registry: single writer, concurrent readers via an internal mutex.
/// Rooms are channel-id → set of session-ids kept in lockstep with each
/// session's own `channels` set.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    rooms: Mutex<HashMap<String, HashSet<String>>>,
    bus: Arc<EventBus>,
    heartbeat_config: HeartbeatConfig,
    sweeping: AtomicBool,
}

impl SessionRegistry {
    pub fn new(bus: Arc<EventBus>, heartbeat_config: HeartbeatConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            bus,
            heartbeat_config,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn register(&self, session: Session) {
        let session_id = session.session_id.clone();
        self.sessions.lock().unwrap().insert(session_id.clone(), session);
        self.bus.emit(
            Event::new(EventKind::SessionConnected, EventPayload::Empty)
                .with_agent(session_id),
        );
    }

    pub fn join_channel(&self, session_id: &str, channel_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        // idempotent: inserting into a HashSet that already has the member is a no-op
        session.channels.insert(channel_id.to_string());
        self.rooms
            .lock()
            .unwrap()
            .entry(channel_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn leave_channel(&self, session_id: &str, channel_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(session_id) {
            session.channels.remove(channel_id);
        }
        drop(sessions);
        if let Some(room) = self.rooms.lock().unwrap().get_mut(channel_id) {
            room.remove(session_id);
        }
        self.bus.emit(
            Event::new(EventKind::SessionDisconnected, EventPayload::Empty)
                .with_channel(channel_id)
                .with_agent(session_id),
        );
    }

    pub fn heartbeat(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.last_heartbeat_ms = Utc::now().timestamp_millis();
        }
    }

    /// Emits `event` scoped to `channel_id`; a no-op if the channel has no
    /// members, since channel-scoped bus delivery (`EventBus::subscribe_channel`)
    /// means nobody could receive it anyway.
    pub fn broadcast(&self, channel_id: &str, event: Event) {
        let room_size = self
            .rooms
            .lock()
            .unwrap()
            .get(channel_id)
            .map(|room| room.len())
            .unwrap_or(0);
        if room_size == 0 {
            return;
        }
        self.bus.emit(event.with_channel(channel_id));
    }

    pub fn for_each_in_channel(&self, channel_id: &str, mut f: impl FnMut(&Session)) {
        let sessions = self.sessions.lock().unwrap();
        if let Some(room) = self.rooms.lock().unwrap().get(channel_id) {
            for session_id in room {
                if let Some(session) = sessions.get(session_id) {
                    f(session);
                }
            }
        }
    }

    pub fn disconnect(&self, session_id: &str) {
        let removed = self.sessions.lock().unwrap().remove(session_id);
        if let Some(session) = removed {
            let mut rooms = self.rooms.lock().unwrap();
            for channel_id in &session.channels {
                if let Some(room) = rooms.get_mut(channel_id) {
                    room.remove(session_id);
                }
            }
            drop(rooms);
            self.bus.emit(
                Event::new(EventKind::SessionDisconnected, EventPayload::Empty)
                    .with_agent(session_id),
            );
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One liveness sweep: any session whose last heartbeat is older than
    /// `timeout_ms` is disconnected. Returns the number dropped.
    #[instrument(skip(self))]
    pub fn sweep_dead_sessions(&self) -> u64 {
        let now = Utc::now().timestamp_millis();
        let timeout_ms = self.heartbeat_config.timeout_ms as i64;
        let dead: Vec<String> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| now - s.last_heartbeat_ms > timeout_ms)
            .map(|s| s.session_id.clone())
            .collect();

        for session_id in &dead {
            info!(session_id, "dropping session: heartbeat timeout");
            self.bus.emit(
                Event::new(EventKind::SessionHeartbeatMissed, EventPayload::Empty)
                    .with_agent(session_id.clone()),
            );
            self.disconnect(session_id);
        }
        observability::record_heartbeat_sweep(dead.len() as u64);
        dead.len() as u64
    }

    /// Spawn the periodic sweep loop. Calling this a second time on the
    /// same registry is a no-op: only one sweep loop runs at a time.
    pub fn spawn_heartbeat_sweeper(self: &Arc<Self>) {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = self.clone();
        let interval = Duration::from_millis(self.heartbeat_config.interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                registry.sweep_dead_sessions();
            }
        });
    }
}
