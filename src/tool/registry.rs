//! Unified lookup over internal in-process tools and external tool-server
//! tools. Generalized from the teacher's `agent/tools/registry.rs`
//! (`HashMap<String, Arc<dyn Tool>>` with a middleware pipeline) by adding a
//! source tag per entry and an internal-wins conflict policy — the teacher
//! only ever had one source, so "overwrite on duplicate" was enough there.

use super::{Tool, ToolDefinition, ToolSource};
use crate::bus::{Event, EventBus, EventPayload};
use crate::observability::EventKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

struct Entry {
    definition: ToolDefinition,
    handler: Option<Arc<dyn Tool>>,
}

pub struct ToolRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    bus: Arc<EventBus>,
    debounce_window: Duration,
    debounce_pending: Arc<AtomicBool>,
}

impl ToolRegistry {
    pub fn new(bus: Arc<EventBus>, debounce_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            bus,
            debounce_window,
            debounce_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register an internal in-process handler.
    pub fn register_internal(&self, tool: Arc<dyn Tool>) {
        let definition = tool.definition();
        self.insert(definition, Some(tool));
    }

    /// Register a definition discovered from an external tool-server; calls
    /// route through `ExternalToolServerManager::call`, so no handler is
    /// stored here.
    pub fn register_external(&self, definition: ToolDefinition) {
        self.insert(definition, None);
    }

    fn insert(&self, definition: ToolDefinition, handler: Option<Arc<dyn Tool>>) {
        let name = definition.name.clone();
        let mut entries = self.entries.lock().unwrap();

        if let Some(existing) = entries.get(&name) {
            let same_source = existing.definition.source == definition.source;
            if !same_source && existing.definition.source.is_internal() {
                warn!(tool = %name, "external tool-server advertised a name already owned by an internal tool; internal wins");
                return;
            }
        }

        entries.insert(
            name.clone(),
            Entry {
                definition,
                handler,
            },
        );
        drop(entries);

        self.bus.emit(
            Event::new(EventKind::ToolRegistered, EventPayload::Empty).with_request_id(name),
        );
        self.schedule_registry_changed();
    }

    pub fn unregister(&self, name: &str) {
        let removed = self.entries.lock().unwrap().remove(name);
        if removed.is_some() {
            self.bus.emit(
                Event::new(EventKind::ToolUnregistered, EventPayload::Empty)
                    .with_request_id(name),
            );
            self.schedule_registry_changed();
        }
    }

    pub fn resolve(&self, name: &str) -> Option<(ToolDefinition, Option<Arc<dyn Tool>>)> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .map(|e| (e.definition.clone(), e.handler.clone()))
    }

    pub fn list(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn list_by_source(&self, source: &ToolSource) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter(|d| &d.source == source)
            .collect()
    }

    /// Debounce `registry:changed` within a small window so a burst of
    /// external-server startup registrations emits one event, not N.
    fn schedule_registry_changed(&self) {
        if self.debounce_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = self.bus.clone();
        let pending = self.debounce_pending.clone();
        let window = self.debounce_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            pending.store(false, Ordering::SeqCst);
            bus.emit(Event::new(EventKind::RegistryChanged, EventPayload::Empty));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationLevel;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "echoes input".into(),
                input_schema: json!({"type": "object"}),
                examples: vec![],
                source: ToolSource::Internal,
                risk_baseline: ValidationLevel::Async,
            }
        }

        async fn execute(&self, input: Value) -> anyhow::Result<super::super::ToolResult> {
            Ok(super::super::ToolResult::ok(input))
        }
    }

    fn external_definition(name: &str, server: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: "external".into(),
            input_schema: json!({"type": "object"}),
            examples: vec![],
            source: ToolSource::External(server.into()),
            risk_baseline: ValidationLevel::Blocking,
        }
    }

    #[tokio::test]
    async fn internal_wins_over_external_conflict() {
        let registry = ToolRegistry::new(Arc::new(EventBus::new()), Duration::from_millis(10));
        registry.register_internal(Arc::new(EchoTool));
        registry.register_external(external_definition("echo", "srv-1"));

        let (def, handler) = registry.resolve("echo").unwrap();
        assert_eq!(def.source, ToolSource::Internal);
        assert!(handler.is_some());
    }

    #[tokio::test]
    async fn unique_names_resolve_by_source() {
        let registry = ToolRegistry::new(Arc::new(EventBus::new()), Duration::from_millis(10));
        registry.register_internal(Arc::new(EchoTool));
        registry.register_external(external_definition("fetch", "srv-1"));

        assert_eq!(registry.list().len(), 2);
        assert_eq!(
            registry
                .list_by_source(&ToolSource::External("srv-1".into()))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let registry = ToolRegistry::new(Arc::new(EventBus::new()), Duration::from_millis(10));
        registry.register_internal(Arc::new(EchoTool));
        registry.unregister("echo");
        assert!(registry.resolve("echo").is_none());
    }

    #[tokio::test]
    async fn registry_changed_debounces_a_burst() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(EventKind::RegistryChanged, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let registry = ToolRegistry::new(bus, Duration::from_millis(20));
        for i in 0..5 {
            registry.register_external(external_definition(&format!("t{i}"), "srv-1"));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
