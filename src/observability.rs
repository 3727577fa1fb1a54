//! Meta-observability: typed event taxonomy plus `metrics` counters/histograms
//! for the boundaries the coordinator and dispatcher care about. No exporter
//! is wired here — recording the measurement is in scope, shipping it out is
//! not.

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Closed taxonomy of events the bus carries between components. New kinds
/// require a deliberate addition here, not a free-form string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionConnected,
    SessionDisconnected,
    SessionHeartbeatMissed,
    ToolRegistered,
    ToolUnregistered,
    RegistryChanged,
    ToolCalled,
    ToolExecution,
    ToolResult,
    ToolError,
    ValidationVerdict,
    InferenceFallback,
    TaskAdded,
    TaskUnblocked,
    TaskBlocked,
    TaskCompleted,
    DagCycleDetected,
    LoopPhaseEntered,
    OrparError,
    MemoryWritten,
    MemoryRetrieved,
    MemoryConsolidated,
    ConfigChanged,
}

impl EventKind {
    /// Every variant, in declaration order — used by the transport to
    /// subscribe a connected session to the whole taxonomy at once.
    pub const ALL: &'static [EventKind] = &[
        EventKind::SessionConnected,
        EventKind::SessionDisconnected,
        EventKind::SessionHeartbeatMissed,
        EventKind::ToolRegistered,
        EventKind::ToolUnregistered,
        EventKind::RegistryChanged,
        EventKind::ToolCalled,
        EventKind::ToolExecution,
        EventKind::ToolResult,
        EventKind::ToolError,
        EventKind::ValidationVerdict,
        EventKind::InferenceFallback,
        EventKind::TaskAdded,
        EventKind::TaskUnblocked,
        EventKind::TaskBlocked,
        EventKind::TaskCompleted,
        EventKind::DagCycleDetected,
        EventKind::LoopPhaseEntered,
        EventKind::OrparError,
        EventKind::MemoryWritten,
        EventKind::MemoryRetrieved,
        EventKind::MemoryConsolidated,
        EventKind::ConfigChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionConnected => "session:connected",
            EventKind::SessionDisconnected => "session:disconnected",
            EventKind::SessionHeartbeatMissed => "session:heartbeat_missed",
            EventKind::ToolRegistered => "tool:registered",
            EventKind::ToolUnregistered => "tool:unregistered",
            EventKind::RegistryChanged => "registry:changed",
            EventKind::ToolCalled => "tool:called",
            EventKind::ToolExecution => "tool:execution",
            EventKind::ToolResult => "tool:result",
            EventKind::ToolError => "tool:error",
            EventKind::ValidationVerdict => "validation:verdict",
            EventKind::InferenceFallback => "inference_fallback",
            EventKind::TaskAdded => "task:added",
            EventKind::TaskUnblocked => "task:unblocked",
            EventKind::TaskBlocked => "task:blocked",
            EventKind::TaskCompleted => "task:completed",
            EventKind::DagCycleDetected => "dag:cycle_detected",
            EventKind::LoopPhaseEntered => "loop:phase_entered",
            EventKind::OrparError => "orpar:error",
            EventKind::MemoryWritten => "memory:written",
            EventKind::MemoryRetrieved => "memory:retrieved",
            EventKind::MemoryConsolidated => "memory:consolidated",
            EventKind::ConfigChanged => "config:changed",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        Some(match s {
            "session:connected" => EventKind::SessionConnected,
            "session:disconnected" => EventKind::SessionDisconnected,
            "session:heartbeat_missed" => EventKind::SessionHeartbeatMissed,
            "tool:registered" => EventKind::ToolRegistered,
            "tool:unregistered" => EventKind::ToolUnregistered,
            "registry:changed" => EventKind::RegistryChanged,
            "tool:called" => EventKind::ToolCalled,
            "tool:execution" => EventKind::ToolExecution,
            "tool:result" => EventKind::ToolResult,
            "tool:error" => EventKind::ToolError,
            "validation:verdict" => EventKind::ValidationVerdict,
            "inference_fallback" => EventKind::InferenceFallback,
            "task:added" => EventKind::TaskAdded,
            "task:unblocked" => EventKind::TaskUnblocked,
            "task:blocked" => EventKind::TaskBlocked,
            "task:completed" => EventKind::TaskCompleted,
            "dag:cycle_detected" => EventKind::DagCycleDetected,
            "loop:phase_entered" => EventKind::LoopPhaseEntered,
            "orpar:error" => EventKind::OrparError,
            "memory:written" => EventKind::MemoryWritten,
            "memory:retrieved" => EventKind::MemoryRetrieved,
            "memory:consolidated" => EventKind::MemoryConsolidated,
            "config:changed" => EventKind::ConfigChanged,
            _ => return None,
        })
    }
}

/// Scoped timer: records a histogram sample on drop, measured from
/// construction. Used to bracket dispatch/validation/retrieval latency
/// without threading an `Instant` by hand through every call site.
pub struct LatencyTimer {
    metric: &'static str,
    started: Instant,
}

impl LatencyTimer {
    pub fn start(metric: &'static str) -> Self {
        Self {
            metric,
            started: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(self.metric).record(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}

pub fn record_dispatch(kind: EventKind) {
    counter!("mxf_events_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_validation_cache(hit: bool) {
    counter!("mxf_validation_cache_total", "outcome" => if hit { "hit" } else { "miss" })
        .increment(1);
}

pub fn record_dag_cycle_rejected() {
    counter!("mxf_dag_cycle_rejections_total").increment(1);
}

pub fn record_heartbeat_sweep(dropped: u64) {
    counter!("mxf_heartbeat_sweeps_total").increment(1);
    counter!("mxf_heartbeat_sessions_dropped_total").increment(dropped);
}

pub fn record_q_update() {
    counter!("mxf_memory_q_updates_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_strings_are_stable() {
        assert_eq!(EventKind::ToolCalled.as_str(), "tool:called");
        assert_eq!(EventKind::InferenceFallback.as_str(), "inference_fallback");
    }
}
