//! Orchestrates a tool call from request to terminal event. Generalized
//! from the teacher's `agent/tools/registry.rs::execute` (spawn + timeout +
//! panic guard, then a middleware chain) into: allow-list check → verdict →
//! resolve → timeout-wrapped execution → exactly-one terminal event →
//! outcome recording.

use super::external::ExternalToolProxy;
use super::registry::ToolRegistry;
use super::{ToolResult, ToolSource};
use crate::bus::{Event, EventBus, EventPayload};
use crate::config::{Config, ValidationLevel};
use crate::errors::{ExecutionErrorKind, MxfError, MxfResult};
use crate::observability::EventKind;
use crate::session::SessionRegistry;
use crate::validation::{PatternLearner, ValidationPipeline};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

pub struct ToolCallRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    pub agent_id: String,
    pub session_id: String,
    pub channel_id: Option<String>,
    pub timeout: Option<Duration>,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    validation: Arc<ValidationPipeline>,
    sessions: Arc<SessionRegistry>,
    bus: Arc<EventBus>,
    pattern_learner: Arc<PatternLearner>,
    default_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        validation: Arc<ValidationPipeline>,
        sessions: Arc<SessionRegistry>,
        bus: Arc<EventBus>,
        pattern_learner: Arc<PatternLearner>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            validation,
            sessions,
            bus,
            pattern_learner,
            default_timeout: Duration::from_millis(config.tool.call_default_timeout_ms),
        }
    }

    #[instrument(skip(self, request), fields(tool = %request.tool_name, request_id = %request.request_id))]
    pub async fn dispatch(&self, request: ToolCallRequest) -> MxfResult<ToolResult> {
        let result = self.dispatch_inner(&request).await;

        match &result {
            Ok(value) => self.emit_terminal(&request, EventKind::ToolResult, value.content.clone()),
            Err(err) => self.emit_terminal(
                &request,
                EventKind::ToolError,
                Value::String(err.to_string()),
            ),
        }

        result
    }

    async fn dispatch_inner(&self, request: &ToolCallRequest) -> MxfResult<ToolResult> {
        self.bus.emit(
            Event::new(EventKind::ToolCalled, EventPayload::Empty)
                .with_agent(request.agent_id.clone())
                .with_request_id(request.request_id.clone()),
        );

        let session = self
            .sessions
            .get(&request.session_id)
            .ok_or_else(|| MxfError::Authorization("unknown session".into()))?;
        if !session.can_call(&request.tool_name) {
            return Err(MxfError::Authorization(format!(
                "agent {} is not permitted to call {}",
                request.agent_id, request.tool_name
            )));
        }

        let (definition, handler) = self
            .registry
            .resolve(&request.tool_name)
            .ok_or_else(|| MxfError::UnknownTool(request.tool_name.clone()))?;

        let verdict = self
            .validation
            .validate(&definition, &request.input, &request.agent_id, None);

        self.bus.emit(
            Event::new(EventKind::ToolExecution, EventPayload::Json(verdict.summary()))
                .with_agent(request.agent_id.clone())
                .with_request_id(request.request_id.clone()),
        );

        if !verdict.valid
            && matches!(verdict.level, ValidationLevel::Blocking | ValidationLevel::Strict)
        {
            return Err(MxfError::ValidationRejected(format!(
                "{} error(s), top: {}",
                verdict.errors.len(),
                verdict
                    .errors
                    .first()
                    .map(|e| e.message.as_str())
                    .unwrap_or("validation failed")
            )));
        }

        let input = verdict.corrected_input.unwrap_or_else(|| request.input.clone());
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let handler = match (handler, &definition.source) {
            (Some(h), _) => h,
            (None, ToolSource::External(_)) => {
                return Err(MxfError::ExternalServer(
                    "external tool has no bound proxy".into(),
                ))
            }
            (None, ToolSource::Internal) => {
                return Err(MxfError::UnknownTool(request.tool_name.clone()))
            }
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, handler.execute(input.clone())).await;

        let result = match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(MxfError::Execution {
                kind: ExecutionErrorKind::ProviderError,
                message: e.to_string(),
            }),
            Err(_) => Err(MxfError::Execution {
                kind: ExecutionErrorKind::Timeout,
                message: format!("tool {} timed out after {timeout:?}", request.tool_name),
            }),
        };

        self.pattern_learner.record_outcome(
            &request.tool_name,
            &request.agent_id,
            &request.input,
            result.is_ok(),
            result.as_ref().err().map(|e| e.kind_tag()),
        );

        self.bus.emit(
            Event::new(
                EventKind::ToolCalled,
                EventPayload::Json(serde_json::json!({
                    "elapsed_ms": started.elapsed().as_millis(),
                    "success": result.is_ok(),
                })),
            )
            .with_request_id(request.request_id.clone()),
        );

        result
    }

    fn emit_terminal(&self, request: &ToolCallRequest, kind: EventKind, payload: Value) {
        let mut event = Event::new(kind, EventPayload::Json(payload))
            .with_agent(request.agent_id.clone())
            .with_request_id(request.request_id.clone());
        if let Some(channel_id) = &request.channel_id {
            event = event.with_channel(channel_id.clone());
        }
        self.bus.emit(event);
    }
}

/// Binds a resolved external tool definition to a live proxy handler so the
/// dispatcher only ever deals with `Option<Arc<dyn Tool>>`. Called by the
/// composition root whenever `ExternalToolServerManager` discovers tools.
pub fn bind_external_proxy(
    definition: super::ToolDefinition,
    server_id: String,
    manager: Arc<super::external::ExternalToolServerManager>,
    timeout: Duration,
) -> Arc<dyn super::Tool> {
    Arc::new(ExternalToolProxy {
        server_id,
        definition,
        manager,
        timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::session::Session;
    use crate::tool::ToolDefinition;
    use crate::validation::SecurityChecker;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl super::super::Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "echo".into(),
                input_schema: json!({"type": "object"}),
                examples: vec![],
                source: ToolSource::Internal,
                risk_baseline: ValidationLevel::Async,
            }
        }

        async fn execute(&self, input: Value) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::ok(input))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl super::super::Tool for SlowTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "slow".into(),
                description: "slow".into(),
                input_schema: json!({"type": "object"}),
                examples: vec![],
                source: ToolSource::Internal,
                risk_baseline: ValidationLevel::Async,
            }
        }

        async fn execute(&self, _input: Value) -> anyhow::Result<ToolResult> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolResult::ok(Value::Null))
        }
    }

    fn dispatcher(registry: Arc<ToolRegistry>) -> (Arc<SessionRegistry>, ToolDispatcher) {
        let bus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionRegistry::new(
            bus.clone(),
            crate::config::HeartbeatConfig::default(),
        ));
        let validation = Arc::new(ValidationPipeline::new(
            ValidationConfig::default(),
            Arc::new(PatternLearner::new()),
            Arc::new(SecurityChecker::default()),
            None,
            bus.clone(),
        ));
        let config = Config::default();
        let dispatcher = ToolDispatcher::new(
            registry,
            validation,
            sessions.clone(),
            bus,
            Arc::new(PatternLearner::new()),
            &config,
        );
        (sessions, dispatcher)
    }

    #[tokio::test]
    async fn successful_call_returns_result() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ToolRegistry::new(bus, Duration::from_millis(10)));
        registry.register_internal(Arc::new(EchoTool));
        let (sessions, dispatcher) = dispatcher(registry);

        let mut session = Session::new("sess-1", "agent-1");
        session.tool_allow_list.insert("echo".into());
        sessions.register(session);

        let result = dispatcher
            .dispatch(ToolCallRequest {
                request_id: "req-1".into(),
                tool_name: "echo".into(),
                input: json!({"x": 1}),
                agent_id: "agent-1".into(),
                session_id: "sess-1".into(),
                channel_id: None,
                timeout: None,
            })
            .await
            .unwrap();

        assert_eq!(result.content, json!({"x": 1}));
    }

    #[tokio::test]
    async fn dispatch_emits_tool_execution_with_the_verdict_regardless_of_outcome() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ToolRegistry::new(bus.clone(), Duration::from_millis(10)));
        registry.register_internal(Arc::new(EchoTool));
        let sessions = Arc::new(SessionRegistry::new(
            bus.clone(),
            crate::config::HeartbeatConfig::default(),
        ));
        let validation = Arc::new(ValidationPipeline::new(
            ValidationConfig::default(),
            Arc::new(PatternLearner::new()),
            Arc::new(SecurityChecker::default()),
            None,
            bus.clone(),
        ));
        let config = Config::default();
        let dispatcher = ToolDispatcher::new(
            registry,
            validation,
            sessions.clone(),
            bus.clone(),
            Arc::new(PatternLearner::new()),
            &config,
        );

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_inner = seen.clone();
        bus.subscribe(EventKind::ToolExecution, move |event| {
            seen_inner.lock().unwrap().push(event.data.as_json());
        });

        let mut session = Session::new("sess-1", "agent-1");
        session.tool_allow_list.insert("echo".into());
        sessions.register(session);

        dispatcher
            .dispatch(ToolCallRequest {
                request_id: "req-1".into(),
                tool_name: "echo".into(),
                input: json!({"x": 1}),
                agent_id: "agent-1".into(),
                session_id: "sess-1".into(),
                channel_id: None,
                timeout: None,
            })
            .await
            .unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["valid"], json!(true));
    }

    #[tokio::test]
    async fn disallowed_tool_is_rejected() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ToolRegistry::new(bus, Duration::from_millis(10)));
        registry.register_internal(Arc::new(EchoTool));
        let (sessions, dispatcher) = dispatcher(registry);

        let mut session = Session::new("sess-1", "agent-1");
        session.tool_allow_list.insert("other_tool".into());
        sessions.register(session);

        let result = dispatcher
            .dispatch(ToolCallRequest {
                request_id: "req-1".into(),
                tool_name: "echo".into(),
                input: json!({}),
                agent_id: "agent-1".into(),
                session_id: "sess-1".into(),
                channel_id: None,
                timeout: None,
            })
            .await;

        assert!(matches!(result, Err(MxfError::Authorization(_))));
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ToolRegistry::new(bus, Duration::from_millis(10)));
        let (sessions, dispatcher) = dispatcher(registry);
        sessions.register(Session::new("sess-1", "agent-1"));

        let result = dispatcher
            .dispatch(ToolCallRequest {
                request_id: "req-1".into(),
                tool_name: "missing".into(),
                input: json!({}),
                agent_id: "agent-1".into(),
                session_id: "sess-1".into(),
                channel_id: None,
                timeout: None,
            })
            .await;

        assert!(matches!(result, Err(MxfError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn timeout_produces_execution_error() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ToolRegistry::new(bus, Duration::from_millis(10)));
        registry.register_internal(Arc::new(SlowTool));
        let (sessions, dispatcher) = dispatcher(registry);
        sessions.register(Session::new("sess-1", "agent-1"));

        let result = dispatcher
            .dispatch(ToolCallRequest {
                request_id: "req-1".into(),
                tool_name: "slow".into(),
                input: json!({}),
                agent_id: "agent-1".into(),
                session_id: "sess-1".into(),
                channel_id: None,
                timeout: Some(Duration::from_millis(20)),
            })
            .await;

        match result {
            Err(MxfError::Execution { kind, .. }) => assert_eq!(kind, ExecutionErrorKind::Timeout),
            other => panic!("expected timeout error, got {other:?}"),
        }
    }
}
