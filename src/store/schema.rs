//! SQLite schema and migrations for case persistence.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for better concurrent access
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    // Root case aggregate; JSON blobs hold the embedded records
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cases (
            id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            stage TEXT NOT NULL,
            state_data TEXT NOT NULL
        )",
        [],
    )?;

    // Full snapshot per mutation, addressable by (case_id, version)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS case_state_snapshots (
            id TEXT PRIMARY KEY,
            case_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            state_data TEXT NOT NULL,
            change_description TEXT,
            changed_by TEXT,
            FOREIGN KEY (case_id) REFERENCES cases(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // Append-only, hash-chained decision events
    conn.execute(
        "CREATE TABLE IF NOT EXISTS decision_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            case_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            decision_made TEXT NOT NULL,
            reasoning TEXT NOT NULL,
            stage TEXT NOT NULL,
            actor TEXT NOT NULL,
            input_data_hash TEXT NOT NULL,
            input_data_summary TEXT,
            alternatives TEXT,
            outcome TEXT,
            signature TEXT NOT NULL,
            previous_event_id TEXT
        )",
        [],
    )?;

    // Digitized policies and raw policy text
    conn.execute(
        "CREATE TABLE IF NOT EXISTS policy_cache (
            id TEXT PRIMARY KEY,
            payer_name TEXT NOT NULL,
            medication_name TEXT NOT NULL,
            policy_version TEXT NOT NULL,
            cached_at TEXT NOT NULL,
            expires_at TEXT,
            content_hash TEXT,
            source_filename TEXT,
            upload_notes TEXT,
            amendment_date TEXT,
            parent_version_id TEXT,
            policy_text TEXT,
            parsed_criteria TEXT
        )",
        [],
    )?;

    // Strategic intelligence keyed by similarity parameters, never case id
    conn.execute(
        "CREATE TABLE IF NOT EXISTS strategic_intelligence_cache (
            id TEXT PRIMARY KEY,
            case_id TEXT NOT NULL,
            cache_key_hash TEXT NOT NULL UNIQUE,
            medication_name TEXT NOT NULL,
            icd10_code TEXT NOT NULL,
            payer_name TEXT NOT NULL,
            cached_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            intelligence_data TEXT NOT NULL,
            similar_cases_count INTEGER NOT NULL,
            confidence_score REAL NOT NULL
        )",
        [],
    )?;

    // Per-call usage accounting for analytics
    conn.execute(
        "CREATE TABLE IF NOT EXISTS llm_usage (
            id TEXT PRIMARY KEY,
            case_id TEXT,
            correlation_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            task_category TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            cost_usd REAL NOT NULL,
            latency_ms INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // Predicted vs actual outcomes for accuracy analytics
    conn.execute(
        "CREATE TABLE IF NOT EXISTS prediction_outcomes (
            id TEXT PRIMARY KEY,
            case_id TEXT NOT NULL,
            predicted_likelihood REAL NOT NULL,
            predicted_status TEXT NOT NULL,
            payer_name TEXT NOT NULL,
            medication_name TEXT NOT NULL,
            actual_outcome TEXT NOT NULL,
            actual_decision_date TEXT,
            strategy_used TEXT,
            was_strategy_effective INTEGER
        )",
        [],
    )?;

    // Indexes for common queries
    conn.execute("CREATE INDEX IF NOT EXISTS idx_cases_stage ON cases(stage)", [])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cases_updated ON cases(updated_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_case ON case_state_snapshots(case_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_case ON decision_events(case_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_policy_lookup
         ON policy_cache(payer_name, medication_name, policy_version)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_intel_case ON strategic_intelligence_cache(case_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_usage_case ON llm_usage(case_id)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='cases'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}
