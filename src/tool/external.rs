//! Lifecycle of child tool-server processes, speaking MCP over their stdio.
//!
//! Process launching itself is an OS collaborator's concern (out of scope);
//! what lives here is the state machine and health-check/restart policy
//! around it. Grounded in the teacher's `agent/tools/mcp/mod.rs`
//! (`rmcp::ServiceExt` + `TokioChildProcess`, one `RunningService` per
//! connected server, `peer().list_all_tools()`/`peer().call_tool()`) and
//! `agent/tools/mcp/proxy.rs` (converting `CallToolResult` content blocks
//! into a single string) and its scrubbed-environment spawning in
//! `utils/subprocess.rs`, generalized from "discover tools once at startup"
//! into a managed, health-checked, restart-on-crash pool the dispatcher
//! resolves through.

use super::{Tool, ToolDefinition};
use crate::bus::{Event, EventBus, EventPayload};
use crate::config::ExternalServerConfig;
use crate::errors::{MxfError, MxfResult};
use crate::observability::EventKind;
use async_trait::async_trait;
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, instrument, warn};

const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TZ",
    "TERM",
    "RUST_LOG",
    "TMPDIR",
    "XDG_RUNTIME_DIR",
];

/// `Command::new(program)` with `env_clear()` plus only the allowlisted
/// variables copied back in, so a tool-server child never inherits secrets
/// from the host process's environment.
pub fn scrubbed_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear();
    for &var in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(var) {
            cmd.env(var, val);
        }
    }
    cmd
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Pipe,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub transport: TransportKind,
    pub auto_start: bool,
    pub restart_on_crash: bool,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Registered,
    Spawning,
    Running,
    Unhealthy,
    Restarting,
    Stopping,
    Stopped,
}

/// An established MCP session over a child process's stdio.
struct McpConnection {
    service: RunningService<RoleClient, ()>,
}

impl McpConnection {
    async fn spawn(config: &ServerConfig) -> anyhow::Result<Self> {
        let mut cmd = scrubbed_command(&config.command);
        cmd.args(&config.args).envs(&config.env);
        let transport = TokioChildProcess::new(cmd)?;
        let service = ().serve(transport).await?;
        Ok(Self { service })
    }

    async fn call(&self, tool_name: &str, input: Value, timeout: Duration) -> MxfResult<Value> {
        let arguments = match input {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                Some(map)
            }
        };
        let mut request = CallToolRequestParams::new(tool_name.to_string());
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }

        let result = tokio::time::timeout(timeout, self.service.peer().call_tool(request))
            .await
            .map_err(|_| MxfError::Timeout(timeout))?
            .map_err(|e| MxfError::ExternalServer(e.to_string()))?;

        if let Some(structured) = result.structured_content {
            return if result.is_error.unwrap_or(false) {
                Err(MxfError::ExternalServer(structured.to_string()))
            } else {
                Ok(structured)
            };
        }

        let text = content_to_text(&result.content);
        if result.is_error.unwrap_or(false) {
            Err(MxfError::ExternalServer(text))
        } else {
            Ok(Value::String(text))
        }
    }

    async fn list_tools(&self) -> MxfResult<Vec<rmcp::model::Tool>> {
        self.service
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| MxfError::ExternalServer(e.to_string()))
    }

    /// Cheap, idempotent request used as a liveness probe.
    async fn ping(&self) -> bool {
        tokio::time::timeout(Duration::from_secs(2), self.service.peer().list_tools(None))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

/// Flattens MCP content blocks into a single string, mirroring the
/// teacher's text/image/audio join in `proxy.rs`.
fn content_to_text(content: &[rmcp::model::Content]) -> String {
    use rmcp::model::RawContent;
    let mut output = String::new();
    for block in content {
        if !output.is_empty() {
            output.push('\n');
        }
        match &block.raw {
            RawContent::Text(text) => output.push_str(&text.text),
            RawContent::Image(img) => {
                output.push_str(&format!("[image: {} ({} bytes)]", img.mime_type, img.data.len()))
            }
            RawContent::Audio(audio) => {
                output.push_str(&format!("[audio: {} ({} bytes)]", audio.mime_type, audio.data.len()))
            }
            _ => output.push_str("[unsupported mcp content type]"),
        }
    }
    if output.is_empty() {
        output = "(no output)".to_string();
    }
    output
}

struct ServerHandle {
    config: ServerConfig,
    state: ServerState,
    connection: Option<Arc<McpConnection>>,
    restart_attempts: u32,
    consecutive_health_failures: u32,
}

pub struct ExternalToolServerManager {
    servers: Mutex<HashMap<String, ServerHandle>>,
    bus: Arc<EventBus>,
    config: ExternalServerConfig,
    request_counter: AtomicU64,
    health_failure_threshold: AtomicU32,
}

impl ExternalToolServerManager {
    pub fn new(bus: Arc<EventBus>, config: ExternalServerConfig) -> Self {
        let health_failure_threshold = AtomicU32::new(config.health_failure_threshold);
        Self {
            servers: Mutex::new(HashMap::new()),
            bus,
            config,
            request_counter: AtomicU64::new(0),
            health_failure_threshold,
        }
    }

    pub fn register_server(&self, config: ServerConfig) {
        let id = config.id.clone();
        self.servers.lock().unwrap().insert(
            id,
            ServerHandle {
                config,
                state: ServerState::Registered,
                connection: None,
                restart_attempts: 0,
                consecutive_health_failures: 0,
            },
        );
    }

    pub fn state(&self, id: &str) -> Option<ServerState> {
        self.servers.lock().unwrap().get(id).map(|h| h.state)
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.lock().unwrap().keys().cloned().collect()
    }

    #[instrument(skip(self))]
    pub async fn spawn(&self, id: &str) -> anyhow::Result<()> {
        {
            let mut servers = self.servers.lock().unwrap();
            let handle = servers
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown external server: {id}"))?;
            handle.state = ServerState::Spawning;
        }

        let config = { self.servers.lock().unwrap().get(id).unwrap().config.clone() };
        let spawned = tokio::time::timeout(
            Duration::from_millis(self.config.startup_timeout_ms),
            McpConnection::spawn(&config),
        )
        .await;

        let mut servers = self.servers.lock().unwrap();
        let handle = servers.get_mut(id).unwrap();
        match spawned {
            Ok(Ok(conn)) => {
                handle.connection = Some(Arc::new(conn));
                handle.state = ServerState::Running;
                handle.restart_attempts = 0;
                info!(server = id, "external tool-server running");
                Ok(())
            }
            Ok(Err(e)) => {
                handle.state = ServerState::Stopped;
                Err(e)
            }
            Err(_) => {
                handle.state = ServerState::Stopped;
                Err(anyhow::anyhow!("startup timed out for server {id}"))
            }
        }
    }

    pub async fn stop(&self, id: &str) {
        let conn = {
            let mut servers = self.servers.lock().unwrap();
            let Some(handle) = servers.get_mut(id) else {
                return;
            };
            handle.state = ServerState::Stopping;
            handle.connection.take()
        };
        if let Some(conn) = conn {
            match Arc::try_unwrap(conn) {
                Ok(mut conn) => {
                    if let Err(e) = conn.service.close_with_timeout(Duration::from_secs(3)).await {
                        warn!(server = id, error = %e, "external tool-server join error on close");
                    }
                }
                Err(conn) => drop(conn),
            }
        }
        if let Some(handle) = self.servers.lock().unwrap().get_mut(id) {
            handle.state = ServerState::Stopped;
        }
    }

    pub async fn call(
        &self,
        id: &str,
        tool_name: &str,
        input: Value,
        timeout: Duration,
    ) -> MxfResult<Value> {
        self.request_counter.fetch_add(1, Ordering::Relaxed);
        let connection = {
            let servers = self.servers.lock().unwrap();
            servers
                .get(id)
                .and_then(|h| h.connection.clone())
                .ok_or_else(|| MxfError::ExternalServer(format!("server {id} not running")))?
        };
        connection.call(tool_name, input, timeout).await
    }

    pub async fn list_tools(&self, id: &str) -> MxfResult<Vec<ToolDefinition>> {
        let connection = {
            let servers = self.servers.lock().unwrap();
            servers
                .get(id)
                .and_then(|h| h.connection.clone())
                .ok_or_else(|| MxfError::ExternalServer(format!("server {id} not running")))?
        };
        let tools = connection.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()).unwrap_or_default(),
                input_schema: Value::Object((*t.input_schema).clone()),
                examples: vec![],
                source: super::ToolSource::External(id.to_string()),
                risk_baseline: crate::config::ValidationLevel::Blocking,
            })
            .collect())
    }

    /// One health-check pass over every running/unhealthy server. Marks
    /// servers unhealthy after `health_failure_threshold` consecutive
    /// failures and restarts them with a bounded attempt count; on
    /// exhaustion the server is stopped and a `registry:changed` event is
    /// emitted so the unified registry drops its tools.
    pub async fn health_check_pass(&self) {
        let ids: Vec<String> = {
            let servers = self.servers.lock().unwrap();
            servers
                .iter()
                .filter(|(_, h)| matches!(h.state, ServerState::Running | ServerState::Unhealthy))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in ids {
            let healthy = self.probe(&id).await;
            let restart_attempt = self.record_health_outcome(&id, healthy);

            if let Some(attempt) = restart_attempt {
                let backoff = Duration::from_secs(1) * 2u32.pow(attempt.min(4));
                tokio::time::sleep(backoff.min(Duration::from_secs(30))).await;
                let _ = self.spawn(&id).await;
            }
        }
    }

    /// Applies one probe outcome to `id`'s handle. Returns `Some(attempt)`
    /// when the caller should restart the server at that attempt number;
    /// the lock is never held across an await.
    fn record_health_outcome(&self, id: &str, healthy: bool) -> Option<u32> {
        let mut servers = self.servers.lock().unwrap();
        let handle = servers.get_mut(id)?;

        if healthy {
            handle.consecutive_health_failures = 0;
            handle.state = ServerState::Running;
            return None;
        }

        handle.consecutive_health_failures += 1;
        if handle.consecutive_health_failures < self.health_failure_threshold.load(Ordering::Relaxed) {
            return None;
        }

        handle.state = ServerState::Unhealthy;
        if !handle.config.restart_on_crash || handle.restart_attempts >= self.config.max_restart_attempts {
            handle.state = ServerState::Stopped;
            handle.connection = None;
            warn!(server = %id, "external tool-server exhausted restart attempts");
            self.bus
                .emit(Event::new(EventKind::RegistryChanged, EventPayload::Empty));
            return None;
        }

        handle.restart_attempts += 1;
        handle.state = ServerState::Restarting;
        Some(handle.restart_attempts)
    }

    async fn probe(&self, id: &str) -> bool {
        let connection = {
            let servers = self.servers.lock().unwrap();
            servers.get(id).and_then(|h| h.connection.clone())
        };
        let Some(connection) = connection else {
            return false;
        };
        connection.ping().await
    }
}

/// Proxy adapting an external server's tool to the in-process `Tool` trait
/// so the dispatcher can treat both sources uniformly after resolution.
pub struct ExternalToolProxy {
    pub server_id: String,
    pub definition: ToolDefinition,
    pub manager: Arc<ExternalToolServerManager>,
    pub timeout: Duration,
}

#[async_trait]
impl Tool for ExternalToolProxy {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, input: Value) -> anyhow::Result<super::ToolResult> {
        match self
            .manager
            .call(&self.server_id, &self.definition.name, input, self.timeout)
            .await
        {
            Ok(value) => Ok(super::ToolResult::ok(value)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubbed_command_clears_secrets() {
        unsafe {
            std::env::set_var("MXF_TEST_SECRET", "leak-me-not");
        }
        let cmd = scrubbed_command("echo");
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(!envs
            .iter()
            .any(|(k, _)| *k == std::ffi::OsStr::new("MXF_TEST_SECRET")));
        unsafe {
            std::env::remove_var("MXF_TEST_SECRET");
        }
    }

    #[test]
    fn register_sets_initial_state() {
        let manager = ExternalToolServerManager::new(
            Arc::new(EventBus::new()),
            ExternalServerConfig::default(),
        );
        manager.register_server(ServerConfig {
            id: "srv-1".into(),
            command: "true".into(),
            args: vec![],
            transport: TransportKind::Pipe,
            auto_start: false,
            restart_on_crash: true,
            env: HashMap::new(),
        });
        assert_eq!(manager.state("srv-1"), Some(ServerState::Registered));
    }

    #[tokio::test]
    async fn call_on_unregistered_server_errors() {
        let manager = ExternalToolServerManager::new(
            Arc::new(EventBus::new()),
            ExternalServerConfig::default(),
        );
        let result = manager
            .call("missing", "tool", Value::Null, Duration::from_millis(10))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spawn_and_call_a_real_mcp_server() {
        let manager = ExternalToolServerManager::new(
            Arc::new(EventBus::new()),
            ExternalServerConfig::default(),
        );
        manager.register_server(ServerConfig {
            id: "srv-1".into(),
            command: "npx".into(),
            args: vec!["-y".into(), "@modelcontextprotocol/server-everything".into()],
            transport: TransportKind::Pipe,
            auto_start: true,
            restart_on_crash: false,
            env: HashMap::new(),
        });
        // Exercises the happy path when an MCP-speaking binary is on PATH;
        // otherwise spawn fails fast and the test is a no-op assertion.
        let _ = manager.spawn("srv-1").await;
    }
}
