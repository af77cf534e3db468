use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{now_s, open_db_connection};

/// Cursor row owned by the detection consumer.
const CONSUMER_CURSOR: &str = "detection_consumer";

const UPSERT_CURSOR: &str = r#"
    INSERT INTO consumer_cursor(name, last_id) VALUES (?1, ?2)
    ON CONFLICT(name) DO UPDATE SET last_id = MAX(last_id, excluded.last_id)
"#;

/// A raw snapshot appended by the capture gate. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedImage {
    pub id: i64,
    pub date: String,
    pub time: String,
    pub image: Vec<u8>,
}

/// A confirmed violation waiting to be appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewIncident {
    pub capture_id: i64,
    pub date: String,
    pub time: String,
    /// Annotated JPEG.
    pub image: Vec<u8>,
    /// Every label that contributed to the decision, as `detector:label`.
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Incident {
    pub id: i64,
    pub capture_id: i64,
    pub date: String,
    pub time: String,
    pub image: Vec<u8>,
    pub labels: Vec<String>,
}

/// Terminal state of one capture after the consumer has looked at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InspectionStatus {
    /// Inspected by every detector, no violation.
    Clean,
    /// Violation found and an incident was written.
    Flagged,
    /// Decode or inference failed; the capture could not be judged.
    Uninspectable,
    /// Never judged, or judged but the incident could not be written.
    Dropped,
}

impl InspectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InspectionStatus::Clean => "clean",
            InspectionStatus::Flagged => "flagged",
            InspectionStatus::Uninspectable => "uninspectable",
            InspectionStatus::Dropped => "dropped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "clean" => Ok(InspectionStatus::Clean),
            "flagged" => Ok(InspectionStatus::Flagged),
            "uninspectable" => Ok(InspectionStatus::Uninspectable),
            "dropped" => Ok(InspectionStatus::Dropped),
            other => Err(anyhow!("unknown inspection status '{}'", other)),
        }
    }
}

/// Outcome to commit for one capture. The incident (if any), the inspection row and
/// the consumer cursor are written atomically.
#[derive(Clone, Debug)]
pub struct Inspection {
    pub capture_id: i64,
    pub status: InspectionStatus,
    pub detail: Option<String>,
    pub incident: Option<NewIncident>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectionRecord {
    pub capture_id: i64,
    pub status: InspectionStatus,
    pub incident_id: Option<i64>,
    pub detail: Option<String>,
}

/// Append-only capture and incident logs, used as the queue between the capture
/// gate and the detection consumer.
///
/// Ids are assigned by the store and strictly increase in append order; the
/// `*_after` queries return rows in ascending id order.
pub trait IncidentStore: Send {
    fn append_capture(&mut self, date: &str, time: &str, image: &[u8]) -> Result<i64>;

    fn captures_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<CapturedImage>>;

    /// Like `captures_after`, without loading the images.
    fn capture_ids_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<i64>>;

    fn count_captures_after(&mut self, after_id: i64) -> Result<u64>;

    /// Highest capture id, or 0 for an empty log.
    fn max_capture_id(&mut self) -> Result<i64>;

    fn incidents_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<Incident>>;

    /// Commits an inspection and advances the consumer cursor in one step.
    /// Returns the new incident id when one was written.
    fn commit_inspection(&mut self, inspection: &Inspection) -> Result<Option<i64>>;

    fn inspection(&mut self, capture_id: i64) -> Result<Option<InspectionRecord>>;

    /// Last capture id committed by the consumer, if it has ever committed.
    fn load_cursor(&mut self) -> Result<Option<i64>>;

    /// Advances the consumer cursor without recording an inspection. A lower
    /// value than the stored one is ignored.
    fn save_cursor(&mut self, last_id: i64) -> Result<()>;
}

pub struct SqliteIncidentStore {
    conn: Connection,
}

impl SqliteIncidentStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open incident store {}", db_path))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS tripwire_captures (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              capture_date TEXT NOT NULL,
              capture_time TEXT NOT NULL,
              image BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS incidents (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              capture_id INTEGER NOT NULL,
              capture_date TEXT NOT NULL,
              capture_time TEXT NOT NULL,
              image BLOB NOT NULL,
              labels_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inspections (
              capture_id INTEGER PRIMARY KEY,
              status TEXT NOT NULL,
              incident_id INTEGER,
              detail TEXT,
              inspected_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS consumer_cursor (
              name TEXT PRIMARY KEY,
              last_id INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Number of inspections per status, for operator summaries.
    pub fn inspection_summary(&mut self) -> Result<BTreeMap<InspectionStatus, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM inspections GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut out = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            out.insert(InspectionStatus::parse(&status)?, count as u64);
        }
        Ok(out)
    }
}

impl IncidentStore for SqliteIncidentStore {
    fn append_capture(&mut self, date: &str, time: &str, image: &[u8]) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tripwire_captures(capture_date, capture_time, image) VALUES (?1, ?2, ?3)",
            params![date, time, image],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn captures_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<CapturedImage>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, capture_date, capture_time, image FROM tripwire_captures
            WHERE id > ?1 ORDER BY id ASC LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![after_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CapturedImage {
                id: row.get(0)?,
                date: row.get(1)?,
                time: row.get(2)?,
                image: row.get(3)?,
            });
        }
        Ok(out)
    }

    fn capture_ids_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM tripwire_captures WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![after_id, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    fn count_captures_after(&mut self, after_id: i64) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tripwire_captures WHERE id > ?1",
            params![after_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn max_capture_id(&mut self) -> Result<i64> {
        let max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(id) FROM tripwire_captures", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    fn incidents_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<Incident>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, capture_id, capture_date, capture_time, image, labels_json
                FROM incidents WHERE id > ?1 ORDER BY id ASC LIMIT ?2
                "#,
            )?;
            let mut rows = stmt.query(params![after_id, limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let labels_json: String = row.get(5)?;
                out.push((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    labels_json,
                ));
            }
            out
        };

        rows.into_iter()
            .map(|(id, capture_id, date, time, image, labels_json)| {
                let labels: Vec<String> = serde_json::from_str(&labels_json)
                    .with_context(|| format!("corrupt labels for incident {}", id))?;
                Ok(Incident {
                    id,
                    capture_id,
                    date,
                    time,
                    image,
                    labels,
                })
            })
            .collect()
    }

    fn commit_inspection(&mut self, inspection: &Inspection) -> Result<Option<i64>> {
        let inspected_at = now_s()? as i64;
        let tx = self.conn.transaction()?;

        let incident_id = match &inspection.incident {
            Some(incident) => {
                let labels_json = serde_json::to_string(&incident.labels)?;
                tx.execute(
                    r#"
                    INSERT INTO incidents(capture_id, capture_date, capture_time, image, labels_json)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![
                        incident.capture_id,
                        incident.date,
                        incident.time,
                        incident.image,
                        labels_json
                    ],
                )?;
                Some(tx.last_insert_rowid())
            }
            None => None,
        };

        tx.execute(
            r#"
            INSERT OR REPLACE INTO inspections(capture_id, status, incident_id, detail, inspected_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                inspection.capture_id,
                inspection.status.as_str(),
                incident_id,
                inspection.detail,
                inspected_at
            ],
        )?;

        tx.execute(UPSERT_CURSOR, params![CONSUMER_CURSOR, inspection.capture_id])?;

        tx.commit()?;
        Ok(incident_id)
    }

    fn inspection(&mut self, capture_id: i64) -> Result<Option<InspectionRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT status, incident_id, detail FROM inspections WHERE capture_id = ?1",
                params![capture_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((status, incident_id, detail)) = row else {
            return Ok(None);
        };
        Ok(Some(InspectionRecord {
            capture_id,
            status: InspectionStatus::parse(&status)?,
            incident_id,
            detail,
        }))
    }

    fn load_cursor(&mut self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT last_id FROM consumer_cursor WHERE name = ?1",
                params![CONSUMER_CURSOR],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn save_cursor(&mut self, last_id: i64) -> Result<()> {
        self.conn
            .execute(UPSERT_CURSOR, params![CONSUMER_CURSOR, last_id])?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    captures: Vec<CapturedImage>,
    incidents: Vec<Incident>,
    inspections: BTreeMap<i64, InspectionRecord>,
    cursor: Option<i64>,
    next_capture_id: i64,
    next_incident_id: i64,
}

impl InMemoryState {
    fn advance_cursor(&mut self, last_id: i64) {
        self.cursor = Some(self.cursor.map_or(last_id, |c| c.max(last_id)));
    }
}

/// Process-local store. Clones share the same logs, so a gate and a consumer can
/// each own a handle.
#[derive(Clone, Debug, Default)]
pub struct InMemoryIncidentStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut InMemoryState) -> Result<T>) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| anyhow!("in-memory incident store lock poisoned"))?;
        f(&mut guard)
    }
}

impl IncidentStore for InMemoryIncidentStore {
    fn append_capture(&mut self, date: &str, time: &str, image: &[u8]) -> Result<i64> {
        self.with_state(|state| {
            state.next_capture_id += 1;
            let id = state.next_capture_id;
            state.captures.push(CapturedImage {
                id,
                date: date.to_string(),
                time: time.to_string(),
                image: image.to_vec(),
            });
            Ok(id)
        })
    }

    fn captures_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<CapturedImage>> {
        self.with_state(|state| {
            Ok(state
                .captures
                .iter()
                .filter(|capture| capture.id > after_id)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn capture_ids_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<i64>> {
        self.with_state(|state| {
            Ok(state
                .captures
                .iter()
                .map(|capture| capture.id)
                .filter(|id| *id > after_id)
                .take(limit)
                .collect())
        })
    }

    fn count_captures_after(&mut self, after_id: i64) -> Result<u64> {
        self.with_state(|state| {
            Ok(state
                .captures
                .iter()
                .filter(|capture| capture.id > after_id)
                .count() as u64)
        })
    }

    fn max_capture_id(&mut self) -> Result<i64> {
        self.with_state(|state| Ok(state.captures.last().map_or(0, |capture| capture.id)))
    }

    fn incidents_after(&mut self, after_id: i64, limit: usize) -> Result<Vec<Incident>> {
        self.with_state(|state| {
            Ok(state
                .incidents
                .iter()
                .filter(|incident| incident.id > after_id)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn commit_inspection(&mut self, inspection: &Inspection) -> Result<Option<i64>> {
        self.with_state(|state| {
            let incident_id = inspection.incident.as_ref().map(|incident| {
                state.next_incident_id += 1;
                let id = state.next_incident_id;
                state.incidents.push(Incident {
                    id,
                    capture_id: incident.capture_id,
                    date: incident.date.clone(),
                    time: incident.time.clone(),
                    image: incident.image.clone(),
                    labels: incident.labels.clone(),
                });
                id
            });
            state.inspections.insert(
                inspection.capture_id,
                InspectionRecord {
                    capture_id: inspection.capture_id,
                    status: inspection.status,
                    incident_id,
                    detail: inspection.detail.clone(),
                },
            );
            state.advance_cursor(inspection.capture_id);
            Ok(incident_id)
        })
    }

    fn inspection(&mut self, capture_id: i64) -> Result<Option<InspectionRecord>> {
        self.with_state(|state| Ok(state.inspections.get(&capture_id).cloned()))
    }

    fn load_cursor(&mut self) -> Result<Option<i64>> {
        self.with_state(|state| Ok(state.cursor))
    }

    fn save_cursor(&mut self, last_id: i64) -> Result<()> {
        self.with_state(|state| {
            state.advance_cursor(last_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flagged(capture_id: i64) -> Inspection {
        Inspection {
            capture_id,
            status: InspectionStatus::Flagged,
            detail: None,
            incident: Some(NewIncident {
                capture_id,
                date: "2025-03-01".to_string(),
                time: "08:15:00".to_string(),
                image: vec![0xFF, 0xD8, 0xFF, 0xD9],
                labels: vec!["ppe:NO-Hardhat".to_string()],
            }),
        }
    }

    fn exercise_store(store: &mut dyn IncidentStore) {
        assert_eq!(store.max_capture_id().unwrap(), 0);
        assert_eq!(store.load_cursor().unwrap(), None);

        let a = store.append_capture("2025-03-01", "08:15:00", b"a").unwrap();
        let b = store.append_capture("2025-03-01", "08:15:30", b"b").unwrap();
        let c = store.append_capture("2025-03-01", "08:16:00", b"c").unwrap();
        assert!(a < b && b < c);
        assert_eq!(store.max_capture_id().unwrap(), c);

        let after_a = store.captures_after(a, 10).unwrap();
        assert_eq!(
            after_a.iter().map(|cap| cap.id).collect::<Vec<_>>(),
            vec![b, c]
        );
        assert_eq!(after_a[0].image, b"b".to_vec());
        assert_eq!(store.captures_after(a, 1).unwrap().len(), 1);
        assert_eq!(store.capture_ids_after(0, 10).unwrap(), vec![a, b, c]);
        assert_eq!(store.capture_ids_after(a, 1).unwrap(), vec![b]);
        assert_eq!(store.count_captures_after(a).unwrap(), 2);

        let incident_id = store.commit_inspection(&flagged(b)).unwrap();
        assert!(incident_id.is_some());
        assert_eq!(store.load_cursor().unwrap(), Some(b));

        // The cursor never moves backwards.
        store
            .commit_inspection(&Inspection {
                capture_id: a,
                status: InspectionStatus::Clean,
                detail: None,
                incident: None,
            })
            .unwrap();
        assert_eq!(store.load_cursor().unwrap(), Some(b));

        store.save_cursor(a).unwrap();
        assert_eq!(store.load_cursor().unwrap(), Some(b));

        let incidents = store.incidents_after(0, 10).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].capture_id, b);
        assert_eq!(incidents[0].labels, vec!["ppe:NO-Hardhat".to_string()]);

        let record = store.inspection(b).unwrap().expect("inspection");
        assert_eq!(record.status, InspectionStatus::Flagged);
        assert_eq!(record.incident_id, incident_id);
        assert_eq!(
            store.inspection(a).unwrap().map(|r| r.status),
            Some(InspectionStatus::Clean)
        );
        assert!(store.inspection(c).unwrap().is_none());
    }

    #[test]
    fn sqlite_store_appends_and_queries_in_id_order() {
        let mut store = SqliteIncidentStore::open(":memory:").unwrap();
        exercise_store(&mut store);
    }

    #[test]
    fn in_memory_store_appends_and_queries_in_id_order() {
        let mut store = InMemoryIncidentStore::new();
        exercise_store(&mut store);
    }

    #[test]
    fn in_memory_clones_share_logs() {
        let mut producer = InMemoryIncidentStore::new();
        let mut consumer = producer.clone();
        producer.append_capture("2025-03-01", "09:00:00", b"x").unwrap();
        assert_eq!(consumer.captures_after(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn sqlite_cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.db");
        let path = path.to_str().unwrap();
        {
            let mut store = SqliteIncidentStore::open(path).unwrap();
            let id = store.append_capture("2025-03-01", "10:00:00", b"x").unwrap();
            store.commit_inspection(&flagged(id)).unwrap();
        }
        let mut store = SqliteIncidentStore::open(path).unwrap();
        assert_eq!(store.load_cursor().unwrap(), Some(1));
        let summary = store.inspection_summary().unwrap();
        assert_eq!(summary.get(&InspectionStatus::Flagged), Some(&1));
    }

    #[test]
    fn saved_cursor_survives_reopen_without_inspections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.db");
        let path = path.to_str().unwrap();
        {
            let mut store = SqliteIncidentStore::open(path).unwrap();
            store.save_cursor(0).unwrap();
            store.append_capture("2025-03-01", "10:00:00", b"x").unwrap();
        }
        let mut store = SqliteIncidentStore::open(path).unwrap();
        assert_eq!(store.load_cursor().unwrap(), Some(0));
        assert_eq!(store.capture_ids_after(0, 10).unwrap(), vec![1]);
        assert!(store.inspection_summary().unwrap().is_empty());
    }
}
