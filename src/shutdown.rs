//! Graceful shutdown sequencing. Grounded in the teacher's
//! `agent/tools/mcp/mod.rs::shutdown` (iterate live connections, log and
//! continue past individual failures rather than aborting the sequence)
//! generalized from "stop MCP servers" into the full drain order spec §6's
//! exit behaviour describes: sessions, then external tool-servers, then the
//! memory layer's deferred reindex queue.

use crate::tool::external::ExternalToolServerManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::memory::MemoryStore;
use crate::session::SessionRegistry;

/// Drains the substrate in dependency order so no component is torn down
/// while another still expects it to answer. Each step logs what it did;
/// a stuck external server is force-stopped after `server_stop_timeout`
/// rather than blocking shutdown indefinitely.
pub async fn shutdown(
    sessions: &Arc<SessionRegistry>,
    external_servers: &Arc<ExternalToolServerManager>,
    memory: &Arc<MemoryStore>,
    server_stop_timeout: Duration,
) {
    let session_count = sessions.len();
    for session_id in sessions.session_ids() {
        sessions.disconnect(&session_id);
    }
    info!(dropped = session_count, "shutdown: drained session registry");

    for id in external_servers.server_ids() {
        match tokio::time::timeout(server_stop_timeout, external_servers.stop(&id)).await {
            Ok(()) => info!(server = %id, "shutdown: external tool-server stopped"),
            Err(_) => warn!(server = %id, "shutdown: external tool-server did not stop in time, abandoning"),
        }
    }

    let recovered = memory.reindex_pending();
    info!(recovered, "shutdown: flushed memory reindex queue");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::{Config, ExternalServerConfig, HeartbeatConfig};
    use crate::memory::embeddings::HashEmbedder;
    use crate::session::Session;

    #[tokio::test]
    async fn shutdown_drains_sessions_and_flushes_memory() {
        let bus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionRegistry::new(bus.clone(), HeartbeatConfig::default()));
        sessions.register(Session::new("s1", "agent-1"));
        let external = Arc::new(ExternalToolServerManager::new(
            bus.clone(),
            ExternalServerConfig::default(),
        ));
        let memory = Arc::new(
            MemoryStore::new(":memory:", Arc::new(HashEmbedder), bus, Config::default().memory).unwrap(),
        );

        shutdown(&sessions, &external, &memory, Duration::from_millis(100)).await;

        assert!(sessions.is_empty());
    }
}
