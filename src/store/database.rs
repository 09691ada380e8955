//! SQLite-backed persistence for cases, snapshots, audit events, and
//! the DB-backed caches.
//!
//! All access funnels through one connection behind a mutex, which
//! serializes per-case mutations; optimistic locking on top of that
//! protects read-modify-write cycles that span multiple calls.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::event::DecisionEvent;
use crate::case::types::{CaseStage, CaseState};
use crate::error::{Error, Result};
use crate::llm::{UsageRecord, UsageSink};
use crate::store::schema::{initialize_schema, is_initialized};

/// A stored case snapshot row.
#[derive(Debug, Clone)]
pub struct CaseSnapshot {
    pub id: String,
    pub case_id: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub state: CaseState,
    pub change_description: Option<String>,
    pub changed_by: Option<String>,
}

/// A cached digitized policy row.
#[derive(Debug, Clone)]
pub struct PolicyCacheRow {
    pub id: String,
    pub payer_name: String,
    pub medication_name: String,
    pub policy_version: String,
    pub cached_at: DateTime<Utc>,
    pub policy_text: Option<String>,
    pub parsed_criteria: Option<Value>,
}

/// A cached strategic-intelligence row.
#[derive(Debug, Clone)]
pub struct IntelligenceCacheRow {
    pub id: String,
    pub case_id: String,
    pub cache_key_hash: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub intelligence_data: Value,
    pub similar_cases_count: i64,
    pub confidence_score: f64,
}

/// A recorded prediction-vs-actual outcome row.
#[derive(Debug, Clone)]
pub struct PredictionOutcome {
    pub id: String,
    pub case_id: String,
    pub predicted_likelihood: f64,
    pub predicted_status: String,
    pub payer_name: String,
    pub medication_name: String,
    pub actual_outcome: String,
    pub actual_decision_date: Option<DateTime<Utc>>,
    pub strategy_used: Option<String>,
    pub was_strategy_effective: Option<bool>,
}

/// SQLite-backed store.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        if !is_initialized(&conn) {
            initialize_schema(&conn)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&conn).map_err(Error::from)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&mut conn)
    }

    // ==================== Case Operations ====================

    /// Insert a new case with its initial snapshot.
    pub fn create_case(&self, state: &CaseState) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO cases (id, version, created_at, updated_at, stage, state_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    state.case_id,
                    state.version,
                    state.created_at.to_rfc3339(),
                    state.updated_at.to_rfc3339(),
                    state.stage.to_string(),
                    state_json,
                ],
            )?;
            insert_snapshot(&tx, state, Some("Case created"), Some("system"))?;
            tx.commit()?;
            Ok(())
        })?;
        info!(case_id = %state.case_id, "case created");
        Ok(())
    }

    /// Load a case by id.
    pub fn get_case(&self, case_id: &str) -> Result<CaseState> {
        let state_json: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT state_data FROM cases WHERE id = ?1",
                params![case_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        let state_json = state_json.ok_or_else(|| Error::CaseNotFound(case_id.to_string()))?;
        Ok(serde_json::from_str(&state_json)?)
    }

    /// List cases, newest first, optionally filtered by stage.
    pub fn list_cases(
        &self,
        stage: Option<CaseStage>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CaseState>> {
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut out = Vec::new();
            match stage {
                Some(stage) => {
                    let mut stmt = conn.prepare(
                        "SELECT state_data FROM cases WHERE stage = ?1
                         ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
                    )?;
                    let mapped = stmt.query_map(
                        params![stage.to_string(), limit as i64, offset as i64],
                        |row| row.get::<_, String>(0),
                    )?;
                    for row in mapped {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT state_data FROM cases
                         ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
                    )?;
                    let mapped =
                        stmt.query_map(params![limit as i64, offset as i64], |row| {
                            row.get::<_, String>(0)
                        })?;
                    for row in mapped {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Error::from))
            .collect()
    }

    /// Count cases, optionally by stage.
    pub fn count_cases(&self, stage: Option<CaseStage>) -> Result<i64> {
        self.with_conn(|conn| match stage {
            Some(stage) => conn.query_row(
                "SELECT COUNT(*) FROM cases WHERE stage = ?1",
                params![stage.to_string()],
                |row| row.get(0),
            ),
            None => conn.query_row("SELECT COUNT(*) FROM cases", [], |row| row.get(0)),
        })
    }

    /// Persist a mutated case state.
    ///
    /// `state.version` must already be incremented by the caller (the
    /// case store owns the read-modify-write cycle); `expected_version`
    /// is the version the caller read. The version check, row update,
    /// and snapshot write happen in one transaction.
    pub fn save_case(
        &self,
        state: &CaseState,
        expected_version: Option<i64>,
        change_description: Option<&str>,
        changed_by: Option<&str>,
    ) -> Result<()> {
        let state_json = serde_json::to_string(state)?;
        let case_id = state.case_id.clone();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let current_version: Option<i64> = tx
                .query_row(
                    "SELECT version FROM cases WHERE id = ?1",
                    params![case_id],
                    |row| row.get(0),
                )
                .optional()?;
            let current_version =
                current_version.ok_or_else(|| Error::CaseNotFound(case_id.clone()))?;

            if let Some(expected) = expected_version {
                if current_version != expected {
                    return Err(Error::OptimisticLockFailed {
                        case_id: case_id.clone(),
                        expected,
                        found: current_version,
                    });
                }
            }

            tx.execute(
                "UPDATE cases SET version = ?2, updated_at = ?3, stage = ?4, state_data = ?5
                 WHERE id = ?1",
                params![
                    case_id,
                    state.version,
                    state.updated_at.to_rfc3339(),
                    state.stage.to_string(),
                    state_json,
                ],
            )?;
            insert_snapshot(&tx, state, change_description, changed_by)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Delete a case and its snapshots.
    pub fn delete_case(&self, case_id: &str) -> Result<bool> {
        let deleted = self.with_conn(|conn| {
            conn.execute("DELETE FROM cases WHERE id = ?1", params![case_id])
        })?;
        Ok(deleted > 0)
    }

    // ==================== Snapshot Operations ====================

    /// All snapshots for a case, oldest first.
    pub fn get_snapshots(&self, case_id: &str) -> Result<Vec<CaseSnapshot>> {
        let rows: Vec<(String, String, i64, String, String, Option<String>, Option<String>)> =
            self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, case_id, version, created_at, state_data,
                            change_description, changed_by
                     FROM case_state_snapshots WHERE case_id = ?1 ORDER BY version ASC",
                )?;
                let mapped = stmt.query_map(params![case_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in mapped {
                    out.push(row?);
                }
                Ok(out)
            })?;

        rows.into_iter()
            .map(|(id, case_id, version, created_at, state_json, desc, by)| {
                Ok(CaseSnapshot {
                    id,
                    case_id,
                    version,
                    created_at: parse_timestamp(&created_at)?,
                    state: serde_json::from_str(&state_json)?,
                    change_description: desc,
                    changed_by: by,
                })
            })
            .collect()
    }

    /// The snapshot at an exact version, if retained.
    pub fn get_snapshot_at_version(
        &self,
        case_id: &str,
        version: i64,
    ) -> Result<Option<CaseSnapshot>> {
        let snapshots = self.get_snapshots(case_id)?;
        Ok(snapshots.into_iter().find(|s| s.version == version))
    }

    // ==================== Decision Events ====================

    /// Append a signed decision event.
    pub fn insert_event(&self, event: &DecisionEvent) -> Result<()> {
        let summary = serde_json::to_string(&event.input_data_summary)?;
        let alternatives = serde_json::to_string(&event.alternatives)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO decision_events (
                    id, case_id, event_type, timestamp, decision_made, reasoning,
                    stage, actor, input_data_hash, input_data_summary, alternatives,
                    outcome, signature, previous_event_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    event.event_id,
                    event.case_id,
                    event.event_type.to_string(),
                    event.timestamp.to_rfc3339(),
                    event.decision_made,
                    event.reasoning,
                    event.stage,
                    event.actor,
                    event.input_data_hash,
                    summary,
                    alternatives,
                    event.outcome,
                    event.signature.as_deref().unwrap_or_default(),
                    event.previous_event_id,
                ],
            )?;
            Ok(())
        })
    }

    /// The latest event for a case, by insertion order.
    pub fn last_event(&self, case_id: &str) -> Result<Option<DecisionEvent>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("{} WHERE case_id = ?1 ORDER BY seq DESC LIMIT 1", EVENT_SELECT),
                params![case_id],
                map_event_row,
            )
            .optional()
        })?;
        row.map(finish_event_row).transpose()
    }

    /// All events for a case, in insertion order.
    pub fn events_for_case(&self, case_id: &str) -> Result<Vec<DecisionEvent>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("{} WHERE case_id = ?1 ORDER BY seq ASC", EVENT_SELECT))?;
            let mapped = stmt.query_map(params![case_id], map_event_row)?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            Ok(out)
        })?;
        rows.into_iter().map(finish_event_row).collect()
    }

    // ==================== Policy Cache ====================

    /// Insert or refresh a policy cache row.
    pub fn put_policy(
        &self,
        payer_name: &str,
        medication_name: &str,
        policy_version: &str,
        policy_text: Option<&str>,
        parsed_criteria: Option<&Value>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let criteria_json = parsed_criteria.map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO policy_cache (
                    id, payer_name, medication_name, policy_version, cached_at,
                    policy_text, parsed_criteria
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    payer_name,
                    medication_name,
                    policy_version,
                    Utc::now().to_rfc3339(),
                    policy_text,
                    criteria_json,
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Newest policy row for a (payer, medication) pair.
    pub fn get_policy(
        &self,
        payer_name: &str,
        medication_name: &str,
    ) -> Result<Option<PolicyCacheRow>> {
        let row: Option<(String, String, String, String, String, Option<String>, Option<String>)> =
            self.with_conn(|conn| {
                conn.query_row(
                    "SELECT id, payer_name, medication_name, policy_version, cached_at,
                            policy_text, parsed_criteria
                     FROM policy_cache
                     WHERE payer_name = ?1 AND medication_name = ?2
                     ORDER BY cached_at DESC LIMIT 1",
                    params![payer_name, medication_name],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    },
                )
                .optional()
            })?;

        row.map(
            |(id, payer_name, medication_name, policy_version, cached_at, text, criteria)| {
                Ok(PolicyCacheRow {
                    id,
                    payer_name,
                    medication_name,
                    policy_version,
                    cached_at: parse_timestamp(&cached_at)?,
                    policy_text: text,
                    parsed_criteria: criteria
                        .map(|c| serde_json::from_str(&c))
                        .transpose()?,
                })
            },
        )
        .transpose()
    }

    // ==================== Strategic Intelligence Cache ====================

    /// Fetch a cache row by key hash, lazily deleting it if expired.
    pub fn get_intelligence(&self, cache_key_hash: &str) -> Result<Option<IntelligenceCacheRow>> {
        let row: Option<(String, String, String, String, String, String, i64, f64)> =
            self.with_conn(|conn| {
                conn.query_row(
                    "SELECT id, case_id, cache_key_hash, cached_at, expires_at,
                            intelligence_data, similar_cases_count, confidence_score
                     FROM strategic_intelligence_cache WHERE cache_key_hash = ?1",
                    params![cache_key_hash],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                )
                .optional()
            })?;

        let Some((id, case_id, key, cached_at, expires_at, data, count, confidence)) = row else {
            debug!(cache_key = &cache_key_hash[..16.min(cache_key_hash.len())], "cache miss");
            return Ok(None);
        };

        let expires_at = parse_timestamp(&expires_at)?;
        if expires_at < Utc::now() {
            info!(cache_key = &cache_key_hash[..16], "cache expired, deleting");
            self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM strategic_intelligence_cache WHERE id = ?1",
                    params![id],
                )
            })?;
            return Ok(None);
        }

        Ok(Some(IntelligenceCacheRow {
            id,
            case_id,
            cache_key_hash: key,
            cached_at: parse_timestamp(&cached_at)?,
            expires_at,
            intelligence_data: serde_json::from_str(&data)?,
            similar_cases_count: count,
            confidence_score: confidence,
        }))
    }

    /// Upsert an intelligence cache row.
    #[allow(clippy::too_many_arguments)]
    pub fn put_intelligence(
        &self,
        case_id: &str,
        cache_key_hash: &str,
        medication_name: &str,
        icd10_code: &str,
        payer_name: &str,
        ttl_hours: i64,
        intelligence_data: &Value,
        similar_cases_count: i64,
        confidence_score: f64,
    ) -> Result<()> {
        let data = serde_json::to_string(intelligence_data)?;
        let now = Utc::now();
        let expires = now + Duration::hours(ttl_hours);
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM strategic_intelligence_cache WHERE cache_key_hash = ?1",
                params![cache_key_hash],
            )?;
            conn.execute(
                "INSERT INTO strategic_intelligence_cache (
                    id, case_id, cache_key_hash, medication_name, icd10_code, payer_name,
                    cached_at, expires_at, intelligence_data, similar_cases_count,
                    confidence_score
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    Uuid::new_v4().to_string(),
                    case_id,
                    cache_key_hash,
                    medication_name,
                    icd10_code,
                    payer_name,
                    now.to_rfc3339(),
                    expires.to_rfc3339(),
                    data,
                    similar_cases_count,
                    confidence_score,
                ],
            )?;
            Ok(())
        })
    }

    /// Delete cached intelligence generated for a case.
    pub fn invalidate_intelligence_for_case(&self, case_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM strategic_intelligence_cache WHERE case_id = ?1",
                params![case_id],
            )
        })
    }

    /// Sweep all expired intelligence rows.
    pub fn cleanup_expired_intelligence(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM strategic_intelligence_cache WHERE expires_at < ?1",
                params![Utc::now().to_rfc3339()],
            )
        })
    }

    // ==================== Usage & Predictions ====================

    /// Usage rows recorded for a case, newest first.
    pub fn usage_for_case(&self, case_id: &str) -> Result<Vec<UsageRecord>> {
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, case_id, correlation_id, provider, model, task_category,
                        input_tokens, output_tokens, cost_usd, latency_ms, created_at
                 FROM llm_usage WHERE case_id = ?1 ORDER BY created_at DESC",
            )?;
            let mapped = stmt.query_map(params![case_id], |row| {
                let record = serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "case_id": row.get::<_, Option<String>>(1)?,
                    "correlation_id": row.get::<_, String>(2)?,
                    "provider": row.get::<_, String>(3)?,
                    "model": row.get::<_, String>(4)?,
                    "task_category": row.get::<_, String>(5)?,
                    "input_tokens": row.get::<_, i64>(6)?,
                    "output_tokens": row.get::<_, i64>(7)?,
                    "cost_usd": row.get::<_, f64>(8)?,
                    "latency_ms": row.get::<_, i64>(9)?,
                    "created_at": row.get::<_, String>(10)?,
                });
                Ok(record.to_string())
            })?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            Ok(out)
        })?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Error::from))
            .collect()
    }

    /// Record a prediction outcome for accuracy analytics.
    pub fn insert_prediction_outcome(&self, outcome: &PredictionOutcome) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO prediction_outcomes (
                    id, case_id, predicted_likelihood, predicted_status, payer_name,
                    medication_name, actual_outcome, actual_decision_date, strategy_used,
                    was_strategy_effective
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    outcome.id,
                    outcome.case_id,
                    outcome.predicted_likelihood,
                    outcome.predicted_status,
                    outcome.payer_name,
                    outcome.medication_name,
                    outcome.actual_outcome,
                    outcome.actual_decision_date.map(|d| d.to_rfc3339()),
                    outcome.strategy_used,
                    outcome.was_strategy_effective.map(|b| b as i64),
                ],
            )?;
            Ok(())
        })
    }
}

impl UsageSink for Database {
    fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        let provider = record.provider.to_string();
        let task = record.task_category.to_string();
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO llm_usage (
                    id, case_id, correlation_id, provider, model, task_category,
                    input_tokens, output_tokens, cost_usd, latency_ms, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.case_id,
                    record.correlation_id,
                    provider,
                    record.model,
                    task,
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.cost_usd,
                    record.latency_ms as i64,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        });
        if let Err(e) = &result {
            warn!(error = %e, "failed to record usage row");
        }
        result
    }
}

const EVENT_SELECT: &str = "SELECT id, case_id, event_type, timestamp, decision_made, reasoning,
        stage, actor, input_data_hash, input_data_summary, alternatives, outcome,
        signature, previous_event_id
 FROM decision_events";

type EventRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn finish_event_row(row: EventRow) -> Result<DecisionEvent> {
    let (
        event_id,
        case_id,
        event_type,
        timestamp,
        decision_made,
        reasoning,
        stage,
        actor,
        input_data_hash,
        summary,
        alternatives,
        outcome,
        signature,
        previous_event_id,
    ) = row;

    Ok(DecisionEvent {
        event_id,
        case_id,
        event_type: serde_json::from_value(Value::String(event_type))?,
        timestamp: parse_timestamp(&timestamp)?,
        decision_made,
        reasoning,
        stage,
        actor,
        input_data_hash,
        input_data_summary: summary
            .map(|s| serde_json::from_str(&s))
            .transpose()?
            .unwrap_or(Value::Null),
        alternatives: alternatives
            .map(|s| serde_json::from_str(&s))
            .transpose()?
            .unwrap_or_default(),
        outcome,
        signature: Some(signature),
        previous_event_id,
    })
}

fn insert_snapshot(
    tx: &rusqlite::Transaction<'_>,
    state: &CaseState,
    change_description: Option<&str>,
    changed_by: Option<&str>,
) -> Result<()> {
    let state_json = serde_json::to_string(state)?;
    tx.execute(
        "INSERT INTO case_state_snapshots (
            id, case_id, version, created_at, state_data, change_description, changed_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            state.case_id,
            state.version,
            Utc::now().to_rfc3339(),
            state_json,
            change_description,
            changed_by,
        ],
    )?;
    Ok(())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::EventType;
    use serde_json::json;

    fn sample_case() -> CaseState {
        CaseState::new()
    }

    #[test]
    fn test_create_and_get_case() {
        let db = Database::in_memory().unwrap();
        let case = sample_case();
        db.create_case(&case).unwrap();

        let loaded = db.get_case(&case.case_id).unwrap();
        assert_eq!(loaded.case_id, case.case_id);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_get_missing_case() {
        let db = Database::in_memory().unwrap();
        let err = db.get_case("CASE-nope").unwrap_err();
        assert!(matches!(err, Error::CaseNotFound(_)));
    }

    #[test]
    fn test_save_case_writes_snapshot() {
        let db = Database::in_memory().unwrap();
        let mut case = sample_case();
        db.create_case(&case).unwrap();

        case.version = 2;
        case.stage = CaseStage::PolicyAnalysis;
        db.save_case(&case, Some(1), Some("advance stage"), Some("system"))
            .unwrap();

        let snapshots = db.get_snapshots(&case.case_id).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].version, 1);
        assert_eq!(snapshots[1].version, 2);
        assert_eq!(snapshots[1].state.stage, CaseStage::PolicyAnalysis);
    }

    #[test]
    fn test_optimistic_lock_failure() {
        let db = Database::in_memory().unwrap();
        let mut case = sample_case();
        db.create_case(&case).unwrap();

        case.version = 2;
        db.save_case(&case, Some(1), None, None).unwrap();

        // A second writer that also read version 1 loses the race.
        let mut stale = db.get_snapshot_at_version(&case.case_id, 1).unwrap().unwrap().state;
        stale.version = 2;
        let err = db.save_case(&stale, Some(1), None, None).unwrap_err();
        assert!(matches!(err, Error::OptimisticLockFailed { found: 2, .. }));
    }

    #[test]
    fn test_snapshot_round_trip_at_version() {
        let db = Database::in_memory().unwrap();
        let mut case = sample_case();
        db.create_case(&case).unwrap();

        case.version = 2;
        case.error_message = Some("transient".to_string());
        db.save_case(&case, Some(1), None, None).unwrap();

        let v1 = db.get_snapshot_at_version(&case.case_id, 1).unwrap().unwrap();
        assert!(v1.state.error_message.is_none());
        let v2 = db.get_snapshot_at_version(&case.case_id, 2).unwrap().unwrap();
        assert_eq!(v2.state.error_message.as_deref(), Some("transient"));
    }

    #[test]
    fn test_events_ordered_by_insertion() {
        let db = Database::in_memory().unwrap();
        let mut trail = crate::audit::event::AuditTrail::new("CASE-1");
        for i in 0..3 {
            let event = DecisionEvent::new(
                "CASE-1",
                EventType::StageChanged,
                format!("decision {}", i),
                "r",
                "intake",
                &json!({"i": i}),
                vec![],
                "system",
            );
            let signed = trail.add_event(event).clone();
            db.insert_event(&signed).unwrap();
        }

        let events = db.events_for_case("CASE-1").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].decision_made, "decision 0");
        assert_eq!(events[2].decision_made, "decision 2");

        let last = db.last_event("CASE-1").unwrap().unwrap();
        assert_eq!(last.decision_made, "decision 2");
    }

    #[test]
    fn test_policy_cache_returns_newest() {
        let db = Database::in_memory().unwrap();
        db.put_policy("cigna", "adalimumab", "v1", Some("old text"), None)
            .unwrap();
        // Second insert is newer (cached_at is later or equal; ties break
        // by scan order after ORDER BY, both rows carry same payer/med)
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.put_policy("cigna", "adalimumab", "v2", Some("new text"), None)
            .unwrap();

        let row = db.get_policy("cigna", "adalimumab").unwrap().unwrap();
        assert_eq!(row.policy_version, "v2");
        assert_eq!(row.policy_text.as_deref(), Some("new text"));
    }

    #[test]
    fn test_intelligence_cache_round_trip_and_expiry() {
        let db = Database::in_memory().unwrap();
        let data = json!({"confidence_score": 0.7});

        db.put_intelligence("CASE-1", "abc123", "infliximab", "K50", "cigna", 24, &data, 10, 0.7)
            .unwrap();
        let row = db.get_intelligence("abc123").unwrap().unwrap();
        assert_eq!(row.similar_cases_count, 10);
        assert_eq!(row.intelligence_data["confidence_score"], 0.7);

        // Zero TTL expires immediately and the read deletes the row.
        db.put_intelligence("CASE-1", "exp", "infliximab", "K50", "cigna", 0, &data, 1, 0.5)
            .unwrap();
        assert!(db.get_intelligence("exp").unwrap().is_none());
        assert!(db.get_intelligence("exp").unwrap().is_none());
    }

    #[test]
    fn test_intelligence_cache_upsert_replaces() {
        let db = Database::in_memory().unwrap();
        let data = json!({"v": 1});
        db.put_intelligence("CASE-1", "k", "m", "K50", "p", 24, &data, 1, 0.5)
            .unwrap();
        let data2 = json!({"v": 2});
        db.put_intelligence("CASE-2", "k", "m", "K50", "p", 24, &data2, 2, 0.6)
            .unwrap();

        let row = db.get_intelligence("k").unwrap().unwrap();
        assert_eq!(row.intelligence_data["v"], 2);
        assert_eq!(row.case_id, "CASE-2");
    }

    #[test]
    fn test_usage_sink_round_trip() {
        use crate::llm::{Provider, TaskCategory};
        let db = Database::in_memory().unwrap();
        let record = UsageRecord {
            id: "u1".to_string(),
            case_id: Some("CASE-1".to_string()),
            correlation_id: "corr-1".to_string(),
            provider: Provider::Claude,
            model: "claude-sonnet".to_string(),
            task_category: TaskCategory::PolicyReasoning,
            input_tokens: 1000,
            output_tokens: 200,
            cost_usd: 0.006,
            latency_ms: 1200,
            created_at: Utc::now(),
        };
        db.record_usage(&record).unwrap();

        let rows = db.usage_for_case("CASE-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].provider, Provider::Claude);
        assert_eq!(rows[0].input_tokens, 1000);
    }

    #[test]
    fn test_list_and_count_by_stage() {
        let db = Database::in_memory().unwrap();
        let mut a = sample_case();
        a.stage = CaseStage::Monitoring;
        db.create_case(&a).unwrap();
        let b = sample_case();
        db.create_case(&b).unwrap();

        assert_eq!(db.count_cases(None).unwrap(), 2);
        assert_eq!(db.count_cases(Some(CaseStage::Monitoring)).unwrap(), 1);
        let listed = db.list_cases(Some(CaseStage::Intake), 10, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].case_id, b.case_id);
    }
}
