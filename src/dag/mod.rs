//! Per-channel task graph with dependency-respecting execution order. No
//! direct teacher precedent (oxicrab has no task graph); follows the
//! teacher's idiom elsewhere in the crate — `Mutex`-guarded `HashMap`
//! state, `tracing` events on rejection, bus events on state transitions.

use crate::bus::{Event, EventBus, EventPayload};
use crate::observability::{self, EventKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub channel_id: String,
    pub title: String,
    pub description: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<String>,
    pub dependencies: HashSet<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, channel_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            title: title.into(),
            description: String::new(),
            priority: 0,
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            dependencies: HashSet::new(),
        }
    }
}

struct ChannelGraph {
    tasks: HashMap<String, Task>,
    /// dependency -> dependents, kept alongside `Task::dependencies` so
    /// readiness propagation doesn't need to scan every task.
    dependents: HashMap<String, HashSet<String>>,
}

impl ChannelGraph {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            dependents: HashMap::new(),
        }
    }

    /// BFS over dependency edges, returning the chain of task ids from
    /// `from` to `to` (inclusive of both ends) if one exists.
    fn path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut parent: HashMap<String, String> = HashMap::new();
        let mut queue = VecDeque::from([from.to_string()]);
        visited.insert(from.to_string());

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut chain = vec![current.clone()];
                let mut node = current;
                while let Some(p) = parent.get(&node) {
                    chain.push(p.clone());
                    node = p.clone();
                }
                chain.reverse();
                return Some(chain);
            }
            if let Some(task) = self.tasks.get(&current) {
                for dep in &task.dependencies {
                    if visited.insert(dep.clone()) {
                        parent.insert(dep.clone(), current.clone());
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
        None
    }

    /// Task ids `task` depends on that are not yet `Completed`.
    fn unmet_dependencies(&self, task: &Task) -> Vec<String> {
        task.dependencies
            .iter()
            .filter(|dep| {
                self.tasks
                    .get(*dep)
                    .map(|d| d.status != TaskStatus::Completed)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }
}

/// Task DAG Scheduler: one graph per channel-id, guarded independently so
/// concurrent channels never contend on the same lock.
pub struct DagScheduler {
    graphs: Mutex<HashMap<String, ChannelGraph>>,
    bus: Arc<EventBus>,
}

impl DagScheduler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            graphs: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn add_task(&self, task: Task) {
        let mut graphs = self.graphs.lock().unwrap();
        let graph = graphs.entry(task.channel_id.clone()).or_insert_with(ChannelGraph::new);
        for dep in &task.dependencies {
            graph.dependents.entry(dep.clone()).or_default().insert(task.id.clone());
        }
        graph.tasks.insert(task.id.clone(), task.clone());
        drop(graphs);
        self.bus.emit(
            Event::new(EventKind::TaskAdded, EventPayload::Empty)
                .with_channel(task.channel_id)
                .with_request_id(task.id),
        );
    }

    /// Rejects an edge that would create a cycle, naming the path found.
    pub fn add_edge(&self, channel_id: &str, dependent: &str, dependency: &str) -> Result<(), String> {
        let mut graphs = self.graphs.lock().unwrap();
        let Some(graph) = graphs.get_mut(channel_id) else {
            return Err(format!("no graph for channel {channel_id}"));
        };

        if !graph.tasks.contains_key(dependent) || !graph.tasks.contains_key(dependency) {
            return Err("both endpoints must reference tasks in this channel".into());
        }

        if dependent == dependency {
            warn!(channel_id, dependent, dependency, "rejecting edge: would create a cycle");
            let cycle_path = vec![dependent.to_string(), dependency.to_string()];
            drop(graphs);
            observability::record_dag_cycle_rejected();
            self.bus.emit(
                Event::new(EventKind::DagCycleDetected, EventPayload::Json(json!({ "path": cycle_path })))
                    .with_channel(channel_id),
            );
            return Err(format!("adding {dependent} -> {dependency} would create a cycle"));
        }

        if let Some(mut cycle_path) = graph.path(dependency, dependent) {
            warn!(channel_id, dependent, dependency, "rejecting edge: would create a cycle");
            cycle_path.insert(0, dependent.to_string());
            drop(graphs);
            observability::record_dag_cycle_rejected();
            self.bus.emit(
                Event::new(EventKind::DagCycleDetected, EventPayload::Json(json!({ "path": cycle_path })))
                    .with_channel(channel_id),
            );
            return Err(format!("adding {dependent} -> {dependency} would create a cycle"));
        }

        graph.tasks.get_mut(dependent).unwrap().dependencies.insert(dependency.to_string());
        graph.dependents.entry(dependency.to_string()).or_default().insert(dependent.to_string());
        Ok(())
    }

    pub fn remove_edge(&self, channel_id: &str, dependent: &str, dependency: &str) {
        let mut graphs = self.graphs.lock().unwrap();
        let Some(graph) = graphs.get_mut(channel_id) else {
            return;
        };
        if let Some(task) = graph.tasks.get_mut(dependent) {
            task.dependencies.remove(dependency);
        }
        if let Some(dependents) = graph.dependents.get_mut(dependency) {
            dependents.remove(dependent);
        }
    }

    fn is_ready(graph: &ChannelGraph, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            graph
                .tasks
                .get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Transitions a task's status, rejecting assigned/in-progress while a
    /// dependency is incomplete, and propagating readiness to dependents
    /// when a task completes.
    pub fn set_status(&self, channel_id: &str, task_id: &str, new_status: TaskStatus) -> Result<(), String> {
        let mut graphs = self.graphs.lock().unwrap();
        let Some(graph) = graphs.get_mut(channel_id) else {
            return Err(format!("no graph for channel {channel_id}"));
        };
        let Some(task) = graph.tasks.get(task_id) else {
            return Err(format!("no task {task_id}"));
        };

        if matches!(new_status, TaskStatus::Assigned | TaskStatus::InProgress) && !Self::is_ready(graph, task)
        {
            let blocking = graph.unmet_dependencies(task);
            drop(graphs);
            self.bus.emit(
                Event::new(EventKind::TaskBlocked, EventPayload::Json(json!({ "blocking": blocking })))
                    .with_channel(channel_id)
                    .with_request_id(task_id),
            );
            return Err(format!("{task_id} is blocked on an incomplete dependency"));
        }

        graph.tasks.get_mut(task_id).unwrap().status = new_status;

        if new_status == TaskStatus::Completed {
            let dependents: Vec<String> = graph
                .dependents
                .get(task_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect();
            let mut newly_ready = Vec::new();
            for dependent_id in dependents {
                if let Some(dependent) = graph.tasks.get(&dependent_id)
                    && Self::is_ready(graph, dependent)
                {
                    newly_ready.push(dependent_id);
                }
            }
            drop(graphs);
            for task_id in newly_ready {
                self.bus.emit(
                    Event::new(
                        EventKind::TaskUnblocked,
                        EventPayload::Json(json!({ "task_id": task_id, "blocking": Vec::<String>::new() })),
                    )
                    .with_channel(channel_id)
                    .with_request_id(task_id),
                );
            }
            self.bus.emit(
                Event::new(
                    EventKind::TaskCompleted,
                    EventPayload::Json(json!({ "task_id": task_id, "blocking": Vec::<String>::new() })),
                )
                .with_channel(channel_id)
                .with_request_id(task_id),
            );
        }

        Ok(())
    }

    pub fn ready(&self, channel_id: &str) -> Vec<String> {
        let graphs = self.graphs.lock().unwrap();
        let Some(graph) = graphs.get(channel_id) else {
            return Vec::new();
        };
        graph
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && Self::is_ready(graph, t))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Kahn's algorithm: level 0 has no incoming edges; level k+1's tasks
    /// have every dependency in levels 0..=k.
    pub fn execution_levels(&self, channel_id: &str) -> Vec<Vec<String>> {
        let graphs = self.graphs.lock().unwrap();
        let Some(graph) = graphs.get(channel_id) else {
            return Vec::new();
        };

        let mut remaining_deps: HashMap<String, HashSet<String>> = graph
            .tasks
            .iter()
            .map(|(id, t)| (id.clone(), t.dependencies.clone()))
            .collect();
        let mut levels = Vec::new();

        loop {
            let level: Vec<String> = remaining_deps
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| id.clone())
                .collect();
            if level.is_empty() {
                break;
            }
            for id in &level {
                remaining_deps.remove(id);
            }
            for deps in remaining_deps.values_mut() {
                for id in &level {
                    deps.remove(id);
                }
            }
            levels.push(level);
        }

        levels
    }

    /// Longest path by task count through the dependency graph, from any
    /// root to any leaf.
    pub fn critical_path(&self, channel_id: &str) -> Vec<String> {
        let levels = self.execution_levels(channel_id);
        let mut longest_to: HashMap<String, Vec<String>> = HashMap::new();

        let graphs = self.graphs.lock().unwrap();
        let Some(graph) = graphs.get(channel_id) else {
            return Vec::new();
        };

        for level in &levels {
            for id in level {
                let task = &graph.tasks[id];
                let best_prefix = task
                    .dependencies
                    .iter()
                    .filter_map(|d| longest_to.get(d))
                    .max_by_key(|path| path.len())
                    .cloned()
                    .unwrap_or_default();
                let mut path = best_prefix;
                path.push(id.clone());
                longest_to.insert(id.clone(), path);
            }
        }

        longest_to
            .into_values()
            .max_by_key(|path| path.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> DagScheduler {
        DagScheduler::new(Arc::new(EventBus::new()))
    }

    fn task(id: &str) -> Task {
        Task::new(id, "general", id)
    }

    #[test]
    fn cycle_is_rejected() {
        let sched = scheduler();
        sched.add_task(task("a"));
        sched.add_task(task("b"));
        sched.add_edge("general", "a", "b").unwrap();
        let result = sched.add_edge("general", "b", "a");
        assert!(result.is_err());
    }

    #[test]
    fn cycle_rejection_emits_dag_cycle_detected_with_the_path() {
        let bus = Arc::new(EventBus::new());
        let sched = DagScheduler::new(bus.clone());
        let seen = Arc::new(Mutex::new(None));
        let seen_inner = seen.clone();
        bus.subscribe(EventKind::DagCycleDetected, move |event| {
            *seen_inner.lock().unwrap() = Some(event.data.as_json());
        });

        sched.add_task(task("a"));
        sched.add_task(task("b"));
        sched.add_edge("general", "a", "b").unwrap();
        assert!(sched.add_edge("general", "b", "a").is_err());

        let payload = seen.lock().unwrap().clone().expect("cycle event fired");
        let path: Vec<String> = serde_json::from_value(payload["path"].clone()).unwrap();
        assert_eq!(path, vec!["b".to_string(), "a".to_string(), "b".to_string()]);
    }

    #[test]
    fn blocked_transition_emits_blocking_dependency_list() {
        let bus = Arc::new(EventBus::new());
        let sched = DagScheduler::new(bus.clone());
        let seen = Arc::new(Mutex::new(None));
        let seen_inner = seen.clone();
        bus.subscribe(EventKind::TaskBlocked, move |event| {
            *seen_inner.lock().unwrap() = Some(event.data.as_json());
        });

        sched.add_task(task("a"));
        sched.add_task(task("b"));
        sched.add_edge("general", "b", "a").unwrap();
        assert!(sched.set_status("general", "b", TaskStatus::InProgress).is_err());

        let payload = seen.lock().unwrap().clone().expect("blocked event fired");
        let blocking: Vec<String> = serde_json::from_value(payload["blocking"].clone()).unwrap();
        assert_eq!(blocking, vec!["a".to_string()]);
    }

    #[test]
    fn self_edge_is_rejected() {
        let sched = scheduler();
        sched.add_task(task("a"));
        assert!(sched.add_edge("general", "a", "a").is_err());
    }

    #[test]
    fn blocked_transition_rejected_until_dependency_completes() {
        let sched = scheduler();
        sched.add_task(task("a"));
        sched.add_task(task("b"));
        sched.add_edge("general", "b", "a").unwrap();

        assert!(sched.set_status("general", "b", TaskStatus::InProgress).is_err());
        sched.set_status("general", "a", TaskStatus::Completed).unwrap();
        assert!(sched.set_status("general", "b", TaskStatus::InProgress).is_ok());
    }

    #[test]
    fn completing_dependency_unblocks_dependent() {
        let sched = scheduler();
        sched.add_task(task("a"));
        sched.add_task(task("b"));
        sched.add_edge("general", "b", "a").unwrap();

        assert_eq!(sched.ready("general"), vec!["a".to_string()]);
        sched.set_status("general", "a", TaskStatus::Completed).unwrap();
        assert_eq!(sched.ready("general"), vec!["b".to_string()]);
    }

    #[test]
    fn execution_levels_bucket_by_depth() {
        let sched = scheduler();
        sched.add_task(task("a"));
        sched.add_task(task("b"));
        sched.add_task(task("c"));
        sched.add_edge("general", "b", "a").unwrap();
        sched.add_edge("general", "c", "b").unwrap();

        let levels = sched.execution_levels("general");
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["a".to_string()]);
        assert_eq!(levels[2], vec!["c".to_string()]);
    }

    #[test]
    fn critical_path_follows_longest_chain() {
        let sched = scheduler();
        sched.add_task(task("a"));
        sched.add_task(task("b"));
        sched.add_task(task("c"));
        sched.add_edge("general", "b", "a").unwrap();
        sched.add_edge("general", "c", "b").unwrap();

        let path = sched.critical_path("general");
        assert_eq!(path, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
}
