//! Stores conversation, action, pattern, and observation records across
//! three strata and reinforces them with TD-style reward attribution.
//! Grounded in the teacher's `agent/memory/memory_db::MemoryDB`
//! (`rusqlite` + FTS5 document store, `hybrid_search`'s weighted-score
//! fusion, `recency_decay`) generalized from its chatbot-specific
//! cost/intent/DLQ bookkeeping into the Q-value utility model this
//! substrate needs.

pub mod embeddings;

use crate::bus::{Event, EventBus, EventPayload};
use crate::config::MemoryConfig;
use crate::errors::{MxfError, MxfResult};
use crate::observability::EventKind;
use embeddings::{cosine_similarity, deserialize, serialize, Embedder};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Conversation,
    Action,
    Pattern,
    Observation,
}

impl MemoryKind {
    fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Conversation => "conversation",
            MemoryKind::Action => "action",
            MemoryKind::Pattern => "pattern",
            MemoryKind::Observation => "observation",
        }
    }

    fn parse(s: &str) -> MemoryKind {
        match s {
            "action" => MemoryKind::Action,
            "pattern" => MemoryKind::Pattern,
            "observation" => MemoryKind::Observation,
            _ => MemoryKind::Conversation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stratum {
    Episodic,
    Semantic,
    Procedural,
}

impl Stratum {
    fn as_str(&self) -> &'static str {
        match self {
            Stratum::Episodic => "episodic",
            Stratum::Semantic => "semantic",
            Stratum::Procedural => "procedural",
        }
    }

    fn parse(s: &str) -> Stratum {
        match s {
            "semantic" => Stratum::Semantic,
            "procedural" => Stratum::Procedural,
            _ => Stratum::Episodic,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: String,
    pub channel_id: String,
    pub agent_id: Option<String>,
    pub kind: MemoryKind,
    pub content: String,
    pub embedding: Vec<f32>,
    pub timestamp_ms: i64,
    pub stratum: Stratum,
    pub q_value: f64,
    pub usage_count: u32,
    pub last_accessed_ms: i64,
    pub archived: bool,
    pub entity_refs: Vec<String>,
}

impl MemoryRecord {
    pub fn new(channel_id: impl Into<String>, kind: MemoryKind, content: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            agent_id: None,
            kind,
            content: content.into(),
            embedding: Vec::new(),
            timestamp_ms: now,
            stratum: Stratum::Episodic,
            q_value: 0.0,
            usage_count: 0,
            last_accessed_ms: now,
            archived: false,
            entity_refs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeEntity {
    pub id: String,
    pub channel_id: String,
    pub type_tag: String,
    pub name: String,
    pub confidence: f64,
    pub q_value: f64,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: MemoryRecord,
    pub similarity: f64,
    pub score: f64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Maps a bounded Q-value into `[0, 1]`.
fn normalize_q(q: f64, bounds: (f64, f64)) -> f64 {
    let (lo, hi) = bounds;
    if (hi - lo).abs() < f64::EPSILON {
        return 0.5;
    }
    ((q - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Exponential recency decay: `0.5 ^ (age_days / half_life_days)`.
fn recency_decay(age_days: f64, half_life_days: u32) -> f64 {
    if half_life_days == 0 || age_days <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(age_days / f64::from(half_life_days))
}

/// Stores, retrieves, and reinforces memory records. Dual-writes every
/// record to a persistent document store (`sqlite`) and an in-memory
/// vector/search index; a search-index failure is queued for later
/// reindex rather than failing the write.
pub struct MemoryStore {
    conn: Mutex<Connection>,
    vector_index: Mutex<Vec<MemoryRecord>>,
    reindex_queue: Mutex<VecDeque<MemoryRecord>>,
    usage_log: Mutex<HashMap<String, Vec<(String, String)>>>,
    entities: Mutex<HashMap<String, KnowledgeEntity>>,
    embedder: Arc<dyn Embedder>,
    bus: Arc<EventBus>,
    config: MemoryConfig,
    missing_reward_attributions: AtomicU64,
}

impl MemoryStore {
    pub fn new(
        db_path: impl AsRef<std::path::Path>,
        embedder: Arc<dyn Embedder>,
        bus: Arc<EventBus>,
        config: MemoryConfig,
    ) -> MxfResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MxfError::Storage(e.to_string()))?;
        }
        let conn = Connection::open(db_path).map_err(|e| MxfError::Storage(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            vector_index: Mutex::new(Vec::new()),
            reindex_queue: Mutex::new(VecDeque::new()),
            usage_log: Mutex::new(HashMap::new()),
            entities: Mutex::new(HashMap::new()),
            embedder,
            bus,
            config,
            missing_reward_attributions: AtomicU64::new(0),
        })
    }

    fn init_schema(conn: &Connection) -> MxfResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_records (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                agent_id TEXT,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                stratum TEXT NOT NULL,
                q_value REAL NOT NULL,
                usage_count INTEGER NOT NULL,
                last_accessed_ms INTEGER NOT NULL,
                archived INTEGER NOT NULL
            );",
        )
        .map_err(|e| MxfError::Storage(e.to_string()))
    }

    /// Dual-write a fresh record to the document store and the vector
    /// index. Returns the generated id.
    pub fn store(&self, record: MemoryRecord) -> MxfResult<String> {
        let id = record.id.clone();
        self.persist(&record)?;
        if let Err(e) = self.index(record.clone()) {
            warn!(error = %e, "search index write failed, queuing for reindex");
            self.reindex_queue.lock().unwrap().push_back(record);
            self.bus.emit(Event::new(
                EventKind::MemoryWritten,
                EventPayload::Json(serde_json::json!({"degraded": true})),
            ));
        } else {
            self.bus.emit(Event::new(EventKind::MemoryWritten, EventPayload::Empty));
        }
        Ok(id)
    }

    fn persist(&self, record: &MemoryRecord) -> MxfResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO memory_records
             (id, channel_id, agent_id, kind, content, embedding, timestamp_ms, stratum, q_value, usage_count, last_accessed_ms, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                record.id,
                record.channel_id,
                record.agent_id,
                record.kind.as_str(),
                record.content,
                serialize(&record.embedding),
                record.timestamp_ms,
                record.stratum.as_str(),
                record.q_value,
                record.usage_count,
                record.last_accessed_ms,
                record.archived as i64,
            ],
        )
        .map_err(|e| MxfError::Storage(e.to_string()))?;
        Ok(())
    }

    fn index(&self, record: MemoryRecord) -> MxfResult<()> {
        let mut index = self.vector_index.lock().unwrap();
        index.retain(|r| r.id != record.id);
        index.push(record);
        Ok(())
    }

    /// Retries every queued record that failed search indexing. Returns how
    /// many were successfully reindexed.
    pub fn reindex_pending(&self) -> usize {
        let pending: Vec<MemoryRecord> = self.reindex_queue.lock().unwrap().drain(..).collect();
        let mut recovered = 0;
        for record in pending {
            if self.index(record).is_ok() {
                recovered += 1;
            }
        }
        recovered
    }

    /// Two-phase retrieval: hybrid candidate generation (keyword + semantic,
    /// blended at `hybrid_ratio`) then utility re-ranking by ORPAR phase.
    pub fn retrieve(
        &self,
        channel_id: &str,
        query_text: &str,
        phase: &str,
        limit: usize,
    ) -> Vec<Candidate> {
        let query_embedding = self.embedder.embed(query_text);
        let keyword_weight = 1.0 - self.config.hybrid_ratio;
        let candidates = self.candidate_generation(channel_id, query_text, &query_embedding, keyword_weight);
        self.utility_rerank(candidates, phase, limit)
    }

    fn candidate_generation(
        &self,
        channel_id: &str,
        query_text: &str,
        query_embedding: &[f32],
        keyword_weight: f64,
    ) -> Vec<(MemoryRecord, f64)> {
        let index = self.vector_index.lock().unwrap();
        let query_tokens: Vec<String> = query_text
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let now = now_ms();

        index
            .iter()
            .filter(|r| r.channel_id == channel_id && !r.archived)
            .map(|record| {
                let similarity = f64::from(cosine_similarity(query_embedding, &record.embedding));
                let keyword_score = if query_tokens.is_empty() {
                    0.0
                } else {
                    let content = record.content.to_lowercase();
                    let hits = query_tokens.iter().filter(|t| content.contains(t.as_str())).count();
                    hits as f64 / query_tokens.len() as f64
                };
                let age_days = (now - record.timestamp_ms) as f64 / 86_400_000.0;
                let decay = recency_decay(age_days, 30);
                let blended = (keyword_weight * keyword_score + (1.0 - keyword_weight) * similarity) * decay;
                (record.clone(), blended.clamp(0.0, 1.0))
            })
            .collect()
    }

    fn utility_rerank(&self, candidates: Vec<(MemoryRecord, f64)>, phase: &str, limit: usize) -> Vec<Candidate> {
        let lambda = self.config.lambda.get(phase).copied().unwrap_or(0.5);
        let mut scored: Vec<Candidate> = candidates
            .into_iter()
            .map(|(record, similarity)| {
                let normalized_q = normalize_q(record.q_value, self.config.q_bounds);
                let score = (1.0 - lambda) * similarity + lambda * normalized_q;
                Candidate { record, similarity, score }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        self.bus.emit(Event::new(EventKind::MemoryRetrieved, EventPayload::Empty));
        scored
    }

    /// Records that `memory_id` was consulted by `task_id` during `phase`,
    /// so a later `attribute` call knows which records to reinforce.
    pub fn record_usage(&self, task_id: &str, memory_id: &str, phase: &str) {
        self.usage_log
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push((memory_id.to_string(), phase.to_string()));
    }

    /// Additive reward attribution: `Q ← Q + α·reward·phase_weight(phase)`,
    /// clamped to the configured bounds. A zero reward is therefore a no-op
    /// on every Q-value it would otherwise touch. Memories referenced by
    /// `task_id` that no longer exist are skipped with a counter increment.
    pub fn attribute(&self, task_id: &str, reward: f64) {
        let usages = self.usage_log.lock().unwrap().remove(task_id).unwrap_or_default();
        if usages.is_empty() {
            self.missing_reward_attributions.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let alpha = self.config.learning_rate;
        let (lo, hi) = self.config.q_bounds;

        for (memory_id, phase) in usages {
            let phase_weight = self.config.lambda.get(&phase).copied().unwrap_or(0.5);
            let mut index = self.vector_index.lock().unwrap();
            let Some(record) = index.iter_mut().find(|r| r.id == memory_id) else {
                drop(index);
                self.missing_reward_attributions.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            record.q_value = (record.q_value + alpha * reward * phase_weight).clamp(lo, hi);
            record.usage_count += 1;
            record.last_accessed_ms = now_ms();
            let updated = record.clone();
            drop(index);

            for entity_id in &updated.entity_refs {
                if let Some(entity) = self.entities.lock().unwrap().get_mut(entity_id) {
                    entity.q_value = (entity.q_value + alpha * 0.5 * reward * phase_weight).clamp(lo, hi);
                }
            }
            let _ = self.persist(&updated);
        }
    }

    pub fn missing_reward_attributions(&self) -> u64 {
        self.missing_reward_attributions.load(Ordering::Relaxed)
    }

    pub fn register_entity(&self, entity: KnowledgeEntity) {
        self.entities.lock().unwrap().insert(entity.id.clone(), entity);
    }

    /// Promotes high-Q, repeatedly-used episodic records into `semantic`,
    /// and archives records idle past `archive_after_ms`. Run periodically
    /// or on ORPAR reflection.
    pub fn consolidate(&self) -> (usize, usize) {
        let mut index = self.vector_index.lock().unwrap();
        let now = now_ms();
        let mut promoted = 0;
        let mut archived = 0;

        for record in index.iter_mut() {
            if record.archived {
                continue;
            }
            if record.stratum == Stratum::Episodic
                && record.q_value >= self.config.promotion_q_threshold
                && record.usage_count >= self.config.promotion_usage_threshold
            {
                record.stratum = Stratum::Semantic;
                promoted += 1;
            }
            let idle_ms = now - record.last_accessed_ms;
            if idle_ms >= 0 && (idle_ms as u64) >= self.config.archive_after_ms {
                record.archived = true;
                archived += 1;
            }
        }

        let snapshot: Vec<MemoryRecord> = index.clone();
        drop(index);
        for record in &snapshot {
            let _ = self.persist(record);
        }

        self.bus.emit(Event::new(EventKind::MemoryConsolidated, EventPayload::Empty));
        (promoted, archived)
    }

    pub fn load_from_disk(&self, channel_id: &str) -> MxfResult<Vec<MemoryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, channel_id, agent_id, kind, content, embedding, timestamp_ms, stratum, q_value, usage_count, last_accessed_ms, archived
                 FROM memory_records WHERE channel_id = ?1",
            )
            .map_err(|e| MxfError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params![channel_id], |row| {
                Ok(MemoryRecord {
                    id: row.get(0)?,
                    channel_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    kind: MemoryKind::parse(&row.get::<_, String>(3)?),
                    content: row.get(4)?,
                    embedding: deserialize(&row.get::<_, Vec<u8>>(5)?),
                    timestamp_ms: row.get(6)?,
                    stratum: Stratum::parse(&row.get::<_, String>(7)?),
                    q_value: row.get(8)?,
                    usage_count: row.get(9)?,
                    last_accessed_ms: row.get(10)?,
                    archived: row.get::<_, i64>(11)? != 0,
                    entity_refs: Vec::new(),
                })
            })
            .map_err(|e| MxfError::Storage(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| MxfError::Storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embeddings::HashEmbedder;

    fn store() -> MemoryStore {
        MemoryStore::new(
            ":memory:",
            Arc::new(HashEmbedder),
            Arc::new(EventBus::new()),
            MemoryConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn store_and_retrieve_roundtrip() {
        let store = store();
        let mut record = MemoryRecord::new("chan-1", MemoryKind::Observation, "the agent observed a recurring timeout");
        record.embedding = HashEmbedder.embed(&record.content);
        store.store(record).unwrap();

        let hits = store.retrieve("chan-1", "recurring timeout", "observe", 5);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn retrieval_ignores_other_channels() {
        let store = store();
        let mut record = MemoryRecord::new("chan-1", MemoryKind::Observation, "alpha");
        record.embedding = HashEmbedder.embed(&record.content);
        store.store(record).unwrap();

        let hits = store.retrieve("chan-2", "alpha", "observe", 5);
        assert!(hits.is_empty());
    }

    #[test]
    fn high_lambda_phase_favors_high_q_over_similarity() {
        let store = store();
        let mut low_q = MemoryRecord::new("chan-1", MemoryKind::Pattern, "shared topic");
        low_q.embedding = HashEmbedder.embed("shared topic exact match");
        let mut high_q = MemoryRecord::new("chan-1", MemoryKind::Pattern, "shared topic");
        high_q.embedding = HashEmbedder.embed("shared topic exact match");
        high_q.q_value = 9.0;

        store.store(low_q.clone()).unwrap();
        store.store(high_q.clone()).unwrap();

        let hits = store.retrieve("chan-1", "shared topic exact match", "act", 2);
        assert_eq!(hits[0].record.id, high_q.id);
    }

    #[test]
    fn attribute_updates_q_value_toward_reward() {
        let store = store();
        let record = MemoryRecord::new("chan-1", MemoryKind::Action, "ran a tool");
        let id = store.store(record).unwrap();

        store.record_usage("task-1", &id, "plan");
        store.attribute("task-1", 1.0);

        let index = store.vector_index.lock().unwrap();
        let updated = index.iter().find(|r| r.id == id).unwrap();
        assert!(updated.q_value > 0.0);
    }

    #[test]
    fn zero_reward_attribution_is_a_no_op_on_q_value() {
        let store = store();
        let mut record = MemoryRecord::new("chan-1", MemoryKind::Action, "ran a tool");
        record.q_value = 3.5;
        let id = store.store(record).unwrap();

        store.record_usage("task-1", &id, "plan");
        store.attribute("task-1", 0.0);

        let index = store.vector_index.lock().unwrap();
        let updated = index.iter().find(|r| r.id == id).unwrap();
        assert_eq!(updated.q_value, 3.5);
    }

    #[test]
    fn attribution_on_missing_memory_increments_counter() {
        let store = store();
        store.record_usage("task-1", "does-not-exist", "act");
        store.attribute("task-1", 1.0);
        assert_eq!(store.missing_reward_attributions(), 1);
    }

    #[test]
    fn attribution_on_unknown_task_increments_counter() {
        let store = store();
        store.attribute("never-tracked", 1.0);
        assert_eq!(store.missing_reward_attributions(), 1);
    }

    #[test]
    fn consolidate_promotes_high_q_frequently_used_records() {
        let store = store();
        let mut record = MemoryRecord::new("chan-1", MemoryKind::Pattern, "well-used pattern");
        record.q_value = 9.0;
        record.usage_count = 10;
        store.store(record).unwrap();

        let (promoted, _) = store.consolidate();
        assert_eq!(promoted, 1);
    }

    #[test]
    fn consolidate_archives_idle_records() {
        let store = store();
        let mut record = MemoryRecord::new("chan-1", MemoryKind::Observation, "stale");
        record.last_accessed_ms = 0;
        store.store(record).unwrap();

        let config = MemoryConfig {
            archive_after_ms: 1,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::new(":memory:", Arc::new(HashEmbedder), Arc::new(EventBus::new()), config).unwrap();
        let mut record = MemoryRecord::new("chan-1", MemoryKind::Observation, "stale");
        record.last_accessed_ms = 0;
        store.store(record).unwrap();

        let (_, archived) = store.consolidate();
        assert_eq!(archived, 1);
    }

    #[test]
    fn store_emits_memory_written_on_the_bus() {
        let bus = Arc::new(EventBus::new());
        let store = MemoryStore::new(":memory:", Arc::new(HashEmbedder), bus.clone(), MemoryConfig::default()).unwrap();

        let seen = Arc::new(Mutex::new(0u32));
        let seen_clone = seen.clone();
        bus.subscribe(EventKind::MemoryWritten, move |_event| {
            *seen_clone.lock().unwrap() += 1;
        });

        let record = MemoryRecord::new("chan-1", MemoryKind::Observation, "an observation");
        store.store(record).unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn reindex_recovers_queued_records() {
        let store = store();
        let record = MemoryRecord::new("chan-1", MemoryKind::Observation, "queued");
        store.reindex_queue.lock().unwrap().push_back(record);
        let recovered = store.reindex_pending();
        assert_eq!(recovered, 1);
    }
}
