//! SQLite-backed `Store`, following the teacher's `DbSignalStorage`: WAL
//! mode, a connection behind a `parking_lot::Mutex`, and rows that pair a
//! handful of indexed columns with a JSON blob for the rest of the struct.

use super::Store;
use crate::errors::{EngineError, EngineResult};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    visitor_id TEXT NOT NULL,
    site_url TEXT NOT NULL,
    last_activity_at INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_sessions_visitor
    ON sessions(visitor_id, last_activity_at DESC);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_events_session
    ON events(session_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS evaluations (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_evaluations_session
    ON evaluations(session_id, created_at DESC);

CREATE TABLE IF NOT EXISTS interventions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    site_url TEXT,
    timestamp INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_interventions_session
    ON interventions(session_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_interventions_site_ts
    ON interventions(site_url, timestamp DESC);

CREATE TABLE IF NOT EXISTS scoring_configs (
    id TEXT PRIMARY KEY,
    site_url TEXT,
    is_active INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_scoring_configs_scope
    ON scoring_configs(site_url, is_active);

CREATE TABLE IF NOT EXISTS experiments (
    id TEXT PRIMARY KEY,
    site_url TEXT,
    status TEXT NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_experiments_scope
    ON experiments(site_url, status);

CREATE TABLE IF NOT EXISTS experiment_assignments (
    experiment_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    variant_id TEXT NOT NULL,
    PRIMARY KEY (experiment_id, session_id)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS shadow_comparisons (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    site_url TEXT,
    created_at INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_shadow_comparisons_site_ts
    ON shadow_comparisons(site_url, created_at DESC);

CREATE TABLE IF NOT EXISTS drift_snapshots (
    id TEXT PRIMARY KEY,
    window_type TEXT NOT NULL,
    site_url TEXT,
    created_at INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_drift_snapshots_scope
    ON drift_snapshots(window_type, site_url, created_at DESC);

CREATE TABLE IF NOT EXISTS drift_alerts (
    id TEXT PRIMARY KEY,
    alert_type TEXT NOT NULL,
    window_type TEXT NOT NULL,
    site_url TEXT,
    created_at INTEGER NOT NULL,
    resolved_at INTEGER,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_drift_alerts_scope
    ON drift_alerts(alert_type, window_type, site_url, created_at DESC);

CREATE TABLE IF NOT EXISTS training_datapoints (
    id TEXT PRIMARY KEY,
    intervention_id TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS job_runs (
    id TEXT PRIMARY KEY,
    job_name TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    data_json TEXT NOT NULL
) WITHOUT ROWID;
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> EngineResult<Self> {
        let conn = Connection::open(db_path).map_err(EngineError::persistence)?;
        conn.execute_batch(SCHEMA_SQL).map_err(EngineError::persistence)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode, "WAL mode not active");
        }

        info!(db_path, "interaction engine store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(EngineError::persistence)?;
        conn.execute_batch(SCHEMA_SQL).map_err(EngineError::persistence)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn site_url_for_session(conn: &Connection, session_id: &str) -> Option<String> {
        conn.query_row(
            "SELECT site_url FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }
}

fn to_json(value: &impl serde::Serialize) -> EngineResult<String> {
    serde_json::to_string(value).map_err(EngineError::persistence)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: String) -> EngineResult<T> {
    serde_json::from_str(&raw).map_err(EngineError::persistence)
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_session(&self, id: &Id) -> EngineResult<Option<Session>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT data_json FROM sessions WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn get_session_by_visitor(&self, visitor_key: &str) -> EngineResult<Option<Session>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM sessions WHERE visitor_id = ?1 ORDER BY last_activity_at DESC LIMIT 1",
                params![visitor_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn put_session(&self, session: &Session) -> EngineResult<()> {
        let conn = self.conn.lock();
        let data = to_json(session)?;
        conn.execute(
            "INSERT INTO sessions (id, visitor_id, site_url, last_activity_at, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                visitor_id = excluded.visitor_id,
                site_url = excluded.site_url,
                last_activity_at = excluded.last_activity_at,
                data_json = excluded.data_json",
            params![
                session.id,
                session.visitor_id,
                session.site_url,
                session.last_activity_at.timestamp_millis(),
                data,
            ],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn put_event(&self, event: &TrackEvent) -> EngineResult<()> {
        let conn = self.conn.lock();
        let data = to_json(event)?;
        conn.execute(
            "INSERT OR REPLACE INTO events (id, session_id, timestamp, data_json) VALUES (?1, ?2, ?3, ?4)",
            params![event.id, event.session_id, event.timestamp.timestamp_millis(), data],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn get_events(&self, ids: &[Id]) -> EngineResult<Vec<TrackEvent>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt = conn
            .prepare_cached("SELECT data_json FROM events WHERE id = ?1")
            .map_err(EngineError::persistence)?;
        for id in ids {
            if let Some(raw) = stmt
                .query_row(params![id], |row| row.get::<_, String>(0))
                .optional()
                .map_err(EngineError::persistence)?
            {
                out.push(from_json(raw)?);
            }
        }
        Ok(out)
    }

    async fn get_event_history(
        &self,
        session_id: &Id,
        excluding: &[Id],
        limit: usize,
    ) -> EngineResult<Vec<TrackEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, data_json FROM events WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(EngineError::persistence)?;
        let rows = stmt
            .query_map(params![session_id, (limit + excluding.len()) as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(EngineError::persistence)?;

        let mut events = Vec::with_capacity(limit);
        for row in rows {
            let (id, raw) = row.map_err(EngineError::persistence)?;
            if excluding.contains(&id) {
                continue;
            }
            events.push(from_json::<TrackEvent>(raw)?);
            if events.len() == limit {
                break;
            }
        }
        events.reverse();
        Ok(events)
    }

    async fn put_evaluation(&self, evaluation: &Evaluation) -> EngineResult<()> {
        let conn = self.conn.lock();
        let data = to_json(evaluation)?;
        conn.execute(
            "INSERT OR REPLACE INTO evaluations (id, session_id, created_at, data_json) VALUES (?1, ?2, ?3, ?4)",
            params![
                evaluation.id,
                evaluation.session_id,
                evaluation.created_at.timestamp_millis(),
                data,
            ],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn get_recent_evaluations(&self, session_id: &Id, limit: usize) -> EngineResult<Vec<Evaluation>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT data_json FROM evaluations WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(EngineError::persistence)?;
        let rows = stmt
            .query_map(params![session_id, limit as i64], |row| row.get::<_, String>(0))
            .map_err(EngineError::persistence)?;
        let mut out = Vec::with_capacity(limit);
        for row in rows {
            out.push(from_json(row.map_err(EngineError::persistence)?)?);
        }
        out.reverse();
        Ok(out)
    }

    async fn get_evaluation(&self, id: &Id) -> EngineResult<Option<Evaluation>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT data_json FROM evaluations WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn put_intervention(&self, intervention: &Intervention) -> EngineResult<()> {
        let conn = self.conn.lock();
        let site_url = Self::site_url_for_session(&conn, &intervention.session_id);
        let data = to_json(intervention)?;
        conn.execute(
            "INSERT INTO interventions (id, session_id, site_url, timestamp, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET data_json = excluded.data_json",
            params![
                intervention.id,
                intervention.session_id,
                site_url,
                intervention.timestamp.timestamp_millis(),
                data,
            ],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn get_intervention(&self, id: &Id) -> EngineResult<Option<Intervention>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM interventions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn get_recent_interventions(&self, session_id: &Id, limit: usize) -> EngineResult<Vec<Intervention>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT data_json FROM interventions WHERE session_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(EngineError::persistence)?;
        let rows = stmt
            .query_map(params![session_id, limit as i64], |row| row.get::<_, String>(0))
            .map_err(EngineError::persistence)?;
        let mut out = Vec::with_capacity(limit);
        for row in rows {
            out.push(from_json(row.map_err(EngineError::persistence)?)?);
        }
        out.reverse();
        Ok(out)
    }

    async fn put_scoring_config(&self, config: &ScoringConfig) -> EngineResult<()> {
        let conn = self.conn.lock();
        let data = to_json(config)?;
        conn.execute(
            "INSERT INTO scoring_configs (id, site_url, is_active, data_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                site_url = excluded.site_url,
                is_active = excluded.is_active,
                data_json = excluded.data_json",
            params![config.id, config.site_url, config.is_active as i64, data],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn get_scoring_config(&self, id: &Id) -> EngineResult<Option<ScoringConfig>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM scoring_configs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn get_active_scoring_config(&self, site_url: Option<&str>) -> EngineResult<Option<ScoringConfig>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM scoring_configs WHERE site_url IS ?1 AND is_active = 1 LIMIT 1",
                params![site_url],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn activate_scoring_config(&self, id: &Id) -> EngineResult<()> {
        let conn = self.conn.lock();
        let scope: Option<String> = conn
            .query_row(
                "SELECT site_url FROM scoring_configs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?
            .flatten();
        conn.execute(
            "UPDATE scoring_configs SET is_active = 0 WHERE site_url IS ?1",
            params![scope],
        )
        .map_err(EngineError::persistence)?;
        conn.execute(
            "UPDATE scoring_configs SET is_active = 1 WHERE id = ?1",
            params![id],
        )
        .map_err(EngineError::persistence)?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM scoring_configs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?;
        if let Some(raw) = raw {
            let mut config: ScoringConfig = from_json(raw)?;
            config.is_active = true;
            let data = to_json(&config)?;
            conn.execute(
                "UPDATE scoring_configs SET data_json = ?1 WHERE id = ?2",
                params![data, id],
            )
            .map_err(EngineError::persistence)?;
        }
        Ok(())
    }

    async fn get_active_experiment(&self, site_url: Option<&str>) -> EngineResult<Option<Experiment>> {
        let conn = self.conn.lock();
        if let Some(site) = site_url {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT data_json FROM experiments WHERE site_url = ?1 AND status = 'running' LIMIT 1",
                    params![site],
                    |row| row.get(0),
                )
                .optional()
                .map_err(EngineError::persistence)?;
            if let Some(raw) = raw {
                return Ok(Some(from_json(raw)?));
            }
        }
        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM experiments WHERE site_url IS NULL AND status = 'running' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn get_assignment(
        &self,
        experiment_id: &Id,
        session_id: &Id,
    ) -> EngineResult<Option<ExperimentAssignment>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT experiment_id, session_id, variant_id FROM experiment_assignments
             WHERE experiment_id = ?1 AND session_id = ?2",
            params![experiment_id, session_id],
            |row| {
                Ok(ExperimentAssignment {
                    experiment_id: row.get(0)?,
                    session_id: row.get(1)?,
                    variant_id: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(EngineError::persistence)
    }

    async fn put_assignment(&self, assignment: &ExperimentAssignment) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO experiment_assignments (experiment_id, session_id, variant_id)
             VALUES (?1, ?2, ?3)",
            params![assignment.experiment_id, assignment.session_id, assignment.variant_id],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn put_shadow_comparison(&self, comparison: &ShadowComparison) -> EngineResult<()> {
        let conn = self.conn.lock();
        let site_url = Self::site_url_for_session(&conn, &comparison.session_id);
        let data = to_json(comparison)?;
        conn.execute(
            "INSERT OR REPLACE INTO shadow_comparisons (id, session_id, site_url, created_at, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                comparison.id,
                comparison.session_id,
                site_url,
                comparison.created_at.timestamp_millis(),
                data,
            ],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn get_shadow_comparisons_since(
        &self,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<ShadowComparison>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT data_json FROM shadow_comparisons WHERE site_url IS ?1 AND created_at >= ?2",
            )
            .map_err(EngineError::persistence)?;
        let rows = stmt
            .query_map(params![site_url, since.timestamp_millis()], |row| row.get::<_, String>(0))
            .map_err(EngineError::persistence)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_json(row.map_err(EngineError::persistence)?)?);
        }
        Ok(out)
    }

    async fn get_interventions_since(
        &self,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<Intervention>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT data_json FROM interventions WHERE site_url IS ?1 AND timestamp >= ?2",
            )
            .map_err(EngineError::persistence)?;
        let rows = stmt
            .query_map(params![site_url, since.timestamp_millis()], |row| row.get::<_, String>(0))
            .map_err(EngineError::persistence)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_json(row.map_err(EngineError::persistence)?)?);
        }
        Ok(out)
    }

    async fn put_drift_snapshot(&self, snapshot: &DriftSnapshot) -> EngineResult<()> {
        let conn = self.conn.lock();
        let data = to_json(snapshot)?;
        conn.execute(
            "INSERT OR REPLACE INTO drift_snapshots (id, window_type, site_url, created_at, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.id,
                snapshot.window_type.as_str(),
                snapshot.site_url,
                snapshot.created_at.timestamp_millis(),
                data,
            ],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn get_latest_drift_snapshot(
        &self,
        window_type: WindowType,
        site_url: Option<&str>,
    ) -> EngineResult<Option<DriftSnapshot>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM drift_snapshots
                 WHERE window_type = ?1 AND site_url IS ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![window_type.as_str(), site_url],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn put_drift_alert(&self, alert: &DriftAlert) -> EngineResult<()> {
        let conn = self.conn.lock();
        let data = to_json(alert)?;
        conn.execute(
            "INSERT OR REPLACE INTO drift_alerts
                (id, alert_type, window_type, site_url, created_at, resolved_at, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                alert.id,
                alert.alert_type,
                alert.window_type.as_str(),
                alert.site_url,
                alert.created_at.timestamp_millis(),
                alert.resolved_at.map(|t| t.timestamp_millis()),
                data,
            ],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }

    async fn find_unresolved_alert_since(
        &self,
        alert_type: &str,
        window_type: WindowType,
        site_url: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<Option<DriftAlert>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data_json FROM drift_alerts
                 WHERE alert_type = ?1 AND window_type = ?2 AND site_url IS ?3
                   AND resolved_at IS NULL AND created_at >= ?4
                 ORDER BY created_at DESC LIMIT 1",
                params![alert_type, window_type.as_str(), site_url, since.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::persistence)?;
        raw.map(from_json).transpose()
    }

    async fn put_training_datapoint(&self, datapoint: &TrainingDatapoint) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let data = to_json(datapoint)?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO training_datapoints (id, intervention_id, created_at, data_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    datapoint.id,
                    datapoint.intervention_id,
                    datapoint.created_at.timestamp_millis(),
                    data,
                ],
            )
            .map_err(EngineError::persistence)?;
        Ok(inserted > 0)
    }

    async fn has_training_datapoint(&self, intervention_id: &Id) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM training_datapoints WHERE intervention_id = ?1",
                params![intervention_id],
                |row| row.get(0),
            )
            .map_err(EngineError::persistence)?;
        Ok(count > 0)
    }

    async fn put_job_run(&self, run: &JobRun) -> EngineResult<()> {
        let conn = self.conn.lock();
        let data = to_json(run)?;
        conn.execute(
            "INSERT INTO job_runs (id, job_name, started_at, data_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET data_json = excluded.data_json",
            params![run.id, run.job_name, run.started_at.timestamp_millis(), data],
        )
        .map_err(EngineError::persistence)?;
        Ok(())
    }
}
