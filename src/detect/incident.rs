use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::detect::{Incident, IncidentStatus, Severity};
use crate::storage::{self, Pool};

/// Incident persistence. The detection engine and the manual API path both
/// create through here, so anomaly-sourced and operator-declared incidents
/// share one contract.
#[derive(Clone)]
pub struct IncidentStore {
    pool: Pool,
}

impl IncidentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn create(&self, title: &str, severity: Severity) -> Result<Incident> {
        let conn = self.pool.get()?;
        let incident = Incident {
            id: Uuid::new_v4(),
            title: title.to_string(),
            severity,
            status: IncidentStatus::Open,
            created_at: Utc::now(),
            resolved_at: None,
        };

        conn.execute(
            "INSERT INTO incidents (id, title, severity, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                incident.id.to_string(),
                incident.title,
                incident.severity.to_string(),
                incident.status.to_string(),
                storage::fmt_ts(incident.created_at),
            ],
        )?;

        Ok(incident)
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<Incident>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, severity, status, created_at, resolved_at
             FROM incidents ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], row_to_incident)?;

        let mut incidents = Vec::new();
        for r in rows {
            incidents.push(r?);
        }
        Ok(incidents)
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<Incident>> {
        let conn = self.pool.get()?;
        let incident = conn
            .query_row(
                "SELECT id, title, severity, status, created_at, resolved_at
                 FROM incidents WHERE id = ?1",
                params![id.to_string()],
                row_to_incident,
            )
            .optional()?;
        Ok(incident)
    }

    /// Operator-driven status transition. Resolving stamps `resolved_at`.
    /// Returns false if no incident with that id exists.
    pub fn set_status(&self, id: &Uuid, status: IncidentStatus) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = if status == IncidentStatus::Resolved {
            conn.execute(
                "UPDATE incidents SET status = ?1, resolved_at = ?2 WHERE id = ?3",
                params![
                    status.to_string(),
                    storage::fmt_ts(Utc::now()),
                    id.to_string()
                ],
            )?
        } else {
            conn.execute(
                "UPDATE incidents SET status = ?1 WHERE id = ?2",
                params![status.to_string(), id.to_string()],
            )?
        };
        Ok(changed > 0)
    }
}

fn row_to_incident(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
    let id_str: String = row.get(0)?;
    let severity_str: String = row.get(2)?;
    let severity = match severity_str.as_str() {
        "CRITICAL" => Severity::Critical,
        "HIGH" => Severity::High,
        "MEDIUM" => Severity::Medium,
        _ => Severity::Low,
    };
    let status_str: String = row.get(3)?;
    let status = match status_str.as_str() {
        "RESOLVED" => IncidentStatus::Resolved,
        "ACKNOWLEDGED" => IncidentStatus::Acknowledged,
        _ => IncidentStatus::Open,
    };
    let created_str: String = row.get(4)?;
    let resolved_str: Option<String> = row.get(5)?;

    Ok(Incident {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        title: row.get(1)?,
        severity,
        status,
        created_at: crate::storage::parse_ts(&created_str).unwrap_or_default(),
        resolved_at: resolved_str.and_then(|s| crate::storage::parse_ts(&s)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (IncidentStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.db");
        let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
        (IncidentStore::new(pool), dir)
    }

    #[test]
    fn test_create_and_get() {
        let (store, _dir) = test_store();
        let created = store.create("Error burst on checkout", Severity::High).unwrap();

        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched.title, "Error burst on checkout");
        assert_eq!(fetched.severity, Severity::High);
        assert_eq!(fetched.status, IncidentStatus::Open);
        assert!(fetched.resolved_at.is_none());
    }

    #[test]
    fn test_list_recent_newest_first() {
        let (store, _dir) = test_store();
        store.create("first", Severity::Low).unwrap();
        store.create("second", Severity::Critical).unwrap();

        let incidents = store.list_recent(10).unwrap();
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].title, "second");
    }

    #[test]
    fn test_resolve_stamps_resolved_at() {
        let (store, _dir) = test_store();
        let incident = store.create("burst", Severity::High).unwrap();

        assert!(store.set_status(&incident.id, IncidentStatus::Acknowledged).unwrap());
        let fetched = store.get(&incident.id).unwrap().unwrap();
        assert_eq!(fetched.status, IncidentStatus::Acknowledged);
        assert!(fetched.resolved_at.is_none());

        assert!(store.set_status(&incident.id, IncidentStatus::Resolved).unwrap());
        let fetched = store.get(&incident.id).unwrap().unwrap();
        assert_eq!(fetched.status, IncidentStatus::Resolved);
        assert!(fetched.resolved_at.is_some());
    }

    #[test]
    fn test_set_status_unknown_id() {
        let (store, _dir) = test_store();
        let missing = Uuid::new_v4();
        assert!(!store.set_status(&missing, IncidentStatus::Resolved).unwrap());
    }
}
