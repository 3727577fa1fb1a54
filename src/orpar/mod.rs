//! Per-agent five-phase state machine (Observe → Reason → Plan → Act →
//! Reflect). Grounded in the teacher's `agent/cognitive/mod.rs`
//! (`CheckpointTracker`: a small per-agent state struct mutated by
//! explicit calls, with a `tracing::warn!` on a misuse it chooses to
//! correct rather than reject) generalized from "tool-call pressure" into
//! "phase-ordering enforcement".

use crate::bus::{Event, EventBus, EventPayload};
use crate::observability::EventKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Observe,
    Reason,
    Plan,
    Act,
    Reflect,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Observe => "observe",
            Phase::Reason => "reason",
            Phase::Plan => "plan",
            Phase::Act => "act",
            Phase::Reflect => "reflect",
        }
    }

    fn next(&self) -> Phase {
        match self {
            Phase::Observe => Phase::Reason,
            Phase::Reason => Phase::Plan,
            Phase::Plan => Phase::Act,
            Phase::Act => Phase::Reflect,
            Phase::Reflect => Phase::Observe,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopState {
    pub current_phase: Option<Phase>,
    pub loop_id: String,
    pub cycle_number: u64,
    pub phase_history: Vec<Phase>,
}

impl LoopState {
    fn fresh() -> Self {
        Self {
            current_phase: None,
            loop_id: Uuid::new_v4().to_string(),
            cycle_number: 0,
            phase_history: Vec::new(),
        }
    }
}

/// Coordinates every agent's progress through the ORPAR cycle. One
/// `LoopState` per agent-id; transitions are validated centrally so two
/// concurrent callers can't race an agent's state into an invalid shape.
pub struct OrparCoordinator {
    states: Mutex<HashMap<String, LoopState>>,
    bus: Arc<EventBus>,
    surprise_threshold: f64,
}

impl OrparCoordinator {
    pub fn new(bus: Arc<EventBus>, surprise_threshold: f64) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            bus,
            surprise_threshold,
        }
    }

    pub fn state_of(&self, agent_id: &str) -> Option<LoopState> {
        self.states.lock().unwrap().get(agent_id).cloned()
    }

    /// Advances `agent_id` into `phase`. `observe` is the only valid entry
    /// from "no loop" or from `reflect` and starts a new cycle. Any other
    /// out-of-order request is rejected and the state is left unchanged.
    pub fn advance(&self, agent_id: &str, phase: Phase) -> Result<LoopState, String> {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(agent_id.to_string()).or_insert_with(LoopState::fresh);

        let allowed = match state.current_phase {
            None => phase == Phase::Observe,
            Some(current) => phase == current.next() || (current == Phase::Reflect && phase == Phase::Observe),
        };

        if !allowed {
            let from = state
                .current_phase
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "no-loop".to_string());
            drop(states);
            self.bus.emit(
                Event::new(
                    EventKind::OrparError,
                    EventPayload::Json(serde_json::json!({
                        "attempted_phase": phase.as_str(),
                        "from_phase": from,
                    })),
                )
                .with_agent(agent_id.to_string()),
            );
            return Err(format!(
                "agent {agent_id} cannot transition to {:?} from {from}",
                phase
            ));
        }

        if phase == Phase::Observe {
            state.cycle_number += 1;
            state.phase_history.clear();
        }
        state.current_phase = Some(phase);
        state.phase_history.push(phase);
        let snapshot = state.clone();
        drop(states);

        self.bus.emit(
            Event::new(EventKind::LoopPhaseEntered, EventPayload::Empty)
                .with_agent(agent_id.to_string())
                .with_request_id(snapshot.loop_id.clone()),
        );
        Ok(snapshot)
    }

    /// Resets the agent to "no loop active" with a fresh loop-id, as an
    /// explicit clear distinct from the reflect→observe wraparound.
    pub fn clear(&self, agent_id: &str) {
        self.states.lock().unwrap().insert(agent_id.to_string(), LoopState::fresh());
    }

    /// Surprise integration: if the memory layer reports a surprise score
    /// above threshold during retrieval, queue an additional observation
    /// and, if a `plan` phase is active, signal it to reconsider.
    pub fn report_surprise(&self, agent_id: &str, surprise_score: f64) {
        if surprise_score <= self.surprise_threshold {
            return;
        }
        self.bus.emit(
            Event::new(EventKind::LoopPhaseEntered, EventPayload::Empty).with_agent(agent_id.to_string()),
        );
        if let Some(state) = self.states.lock().unwrap().get(agent_id)
            && state.current_phase == Some(Phase::Plan)
        {
            self.bus.emit(
                Event::new(EventKind::LoopPhaseEntered, EventPayload::Empty)
                    .with_agent(agent_id.to_string())
                    .with_request_id("plan:reconsider"),
            );
        }
    }
}
