//! Case record store: the `SearchBackend` collaborator and its implementations.
//!
//! Discovery strategies are rendered to read-only SQL (`count_query`,
//! `id_list_query`) that a backend executes. `SqliteSearchBackend` runs them
//! against a `cases` table with an FTS5 index and a `trigram_similarity`
//! scalar function; `ScriptedSearchBackend` answers from canned rules and is
//! meant for tests and dry runs.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, InterruptHandle, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Identifier of a case record.
pub type CaseId = i64;

/// Columns a strategy may select from the `cases` table.
pub const CASE_COLUMNS: &[&str] = &[
    "title",
    "court",
    "decision_date",
    "keywords",
    "summary",
    "content",
];

/// A case row as returned by `rows_for_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRow {
    pub id: CaseId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A case record to load into the SQLite store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: CaseId,
    pub title: String,
    #[serde(default)]
    pub court: Option<String>,
    #[serde(default)]
    pub decision_date: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// The record store as seen by discovery and chunk execution.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Execute a discovery strategy, returning the total match count and the ranked id list.
    async fn run(
        &self,
        count_query: &str,
        id_list_query: &str,
    ) -> Result<(usize, Vec<CaseId>), DiscoveryError>;

    /// Fetch rows for the given ids, in the order requested.
    ///
    /// An empty `columns` slice selects every known column.
    async fn rows_for_ids(
        &self,
        ids: &[CaseId],
        columns: &[String],
    ) -> Result<Vec<CaseRow>, DiscoveryError>;
}

/// Trigram (character 3-gram) Jaccard similarity between two strings, in `[0, 1]`.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    fn grams(s: &str) -> HashSet<String> {
        let padded: Vec<char> = format!("  {} ", s.to_lowercase()).chars().collect();
        padded
            .windows(3)
            .map(|w| w.iter().collect::<String>())
            .collect()
    }
    let (ga, gb) = (grams(a), grams(b));
    let union = ga.union(&gb).count();
    if union == 0 {
        return 0.0;
    }
    ga.intersection(&gb).count() as f64 / union as f64
}

fn is_read_only(sql: &str) -> bool {
    let trimmed = sql.trim().trim_end_matches(';');
    let upper = trimmed.to_uppercase();
    (upper.starts_with("SELECT") || upper.starts_with("WITH")) && !trimmed.contains(';')
}

fn backend_error(e: impl std::fmt::Display) -> DiscoveryError {
    DiscoveryError::Backend {
        message: e.to_string(),
    }
}

fn sql_value_to_json(value: rusqlite::types::Value) -> Value {
    match value {
        rusqlite::types::Value::Null => Value::Null,
        rusqlite::types::Value::Integer(i) => Value::from(i),
        rusqlite::types::Value::Real(f) => Value::from(f),
        rusqlite::types::Value::Text(s) => Value::String(s),
        rusqlite::types::Value::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}

/// SQLite-backed case store.
///
/// Statements run on the blocking pool. When the awaiting future is dropped
/// (a queue job timing out, for instance) the statement in flight is
/// interrupted, so the connection is free for the next job.
pub struct SqliteSearchBackend {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

const WORK_PENDING: u8 = 0;
const WORK_RUNNING: u8 = 1;
const WORK_DONE: u8 = 2;
const WORK_ABANDONED: u8 = 3;

/// Tracks one unit of blocking work; dropped before completion, it cancels
/// work still waiting for the connection and interrupts work already running.
struct InterruptOnDrop {
    handle: Option<Arc<InterruptHandle>>,
    state: Arc<AtomicU8>,
}

impl InterruptOnDrop {
    fn armed(handle: &Arc<InterruptHandle>) -> Self {
        Self {
            handle: Some(Arc::clone(handle)),
            state: Arc::new(AtomicU8::new(WORK_PENDING)),
        }
    }

    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let abandoned_early = self
            .state
            .compare_exchange(WORK_PENDING, WORK_ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !abandoned_early && self.state.load(Ordering::SeqCst) == WORK_RUNNING {
            warn!("Case store query abandoned; interrupting the running statement");
            handle.interrupt();
        }
    }
}

impl SqliteSearchBackend {
    /// Open (and initialize if needed) a database file.
    pub fn open(path: &Path) -> Result<Self, DiscoveryError> {
        let conn = Connection::open(path).map_err(backend_error)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DiscoveryError> {
        let conn = Connection::open_in_memory().map_err(backend_error)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DiscoveryError> {
        conn.create_scalar_function(
            "trigram_similarity",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let a: Option<String> = ctx.get(0)?;
                let b: Option<String> = ctx.get(1)?;
                Ok(trigram_similarity(
                    a.as_deref().unwrap_or(""),
                    b.as_deref().unwrap_or(""),
                ))
            },
        )
        .map_err(backend_error)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cases (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                court TEXT,
                decision_date TEXT,
                keywords TEXT,
                summary TEXT,
                content TEXT
            );
            CREATE VIRTUAL TABLE IF NOT EXISTS cases_fts USING fts5(title, summary, content);",
        )
        .map_err(backend_error)?;

        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    /// Run `work` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T, DiscoveryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DiscoveryError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let guard = InterruptOnDrop::armed(&self.interrupt);
        let state = Arc::clone(&guard.state);
        let joined = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(backend_error)?;
            if state
                .compare_exchange(WORK_PENDING, WORK_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(backend_error("Case store query abandoned before it started"));
            }
            let outcome = work(&mut conn);
            state.store(WORK_DONE, Ordering::SeqCst);
            outcome
        })
        .await;
        guard.disarm();
        joined.map_err(|e| backend_error(format!("Task join error: {e}")))?
    }

    /// Insert or replace case records, keeping the full-text index in sync.
    pub async fn insert_cases(&self, cases: Vec<CaseRecord>) -> Result<usize, DiscoveryError> {
        self.blocking(move |conn| {
            let tx = conn.transaction().map_err(backend_error)?;
            for case in &cases {
                tx.execute(
                    "INSERT OR REPLACE INTO cases (id, title, court, decision_date, keywords, summary, content)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        case.id,
                        case.title,
                        case.court,
                        case.decision_date,
                        case.keywords,
                        case.summary,
                        case.content
                    ],
                )
                .map_err(backend_error)?;
                tx.execute("DELETE FROM cases_fts WHERE rowid = ?1", params![case.id])
                    .map_err(backend_error)?;
                tx.execute(
                    "INSERT INTO cases_fts (rowid, title, summary, content) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        case.id,
                        case.title,
                        case.summary.clone().unwrap_or_default(),
                        case.content.clone().unwrap_or_default()
                    ],
                )
                .map_err(backend_error)?;
            }
            tx.commit().map_err(backend_error)?;
            Ok(cases.len())
        })
        .await
    }
}

#[async_trait]
impl SearchBackend for SqliteSearchBackend {
    async fn run(
        &self,
        count_query: &str,
        id_list_query: &str,
    ) -> Result<(usize, Vec<CaseId>), DiscoveryError> {
        for sql in [count_query, id_list_query] {
            if !is_read_only(sql) {
                return Err(DiscoveryError::Backend {
                    message: format!("Refusing non-SELECT discovery statement: {sql}"),
                });
            }
        }

        let count_sql = count_query.to_string();
        let ids_sql = id_list_query.to_string();
        debug!(count_query = %count_sql, id_list_query = %ids_sql, "Running discovery queries");

        self.blocking(move |conn| {
            let count: i64 = conn
                .query_row(&count_sql, [], |row| row.get(0))
                .map_err(backend_error)?;
            let mut stmt = conn.prepare(&ids_sql).map_err(backend_error)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .map_err(backend_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend_error)?;
            Ok((count.max(0) as usize, ids))
        })
        .await
    }

    async fn rows_for_ids(
        &self,
        ids: &[CaseId],
        columns: &[String],
    ) -> Result<Vec<CaseRow>, DiscoveryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let selected: Vec<String> = if columns.is_empty() {
            CASE_COLUMNS.iter().map(|c| c.to_string()).collect()
        } else {
            columns
                .iter()
                .filter(|c| CASE_COLUMNS.contains(&c.as_str()))
                .cloned()
                .collect()
        };

        let placeholders = vec!["?"; ids.len()].join(", ");
        let column_list = std::iter::once("id".to_string())
            .chain(selected.iter().cloned())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {column_list} FROM cases WHERE id IN ({placeholders})");
        let wanted = ids.to_vec();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(backend_error)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(wanted.iter()), |row| {
                    let id: i64 = row.get(0)?;
                    let mut fields = Map::new();
                    for (i, name) in selected.iter().enumerate() {
                        let value: rusqlite::types::Value = row.get(i + 1)?;
                        fields.insert(name.clone(), sql_value_to_json(value));
                    }
                    Ok(CaseRow { id, fields })
                })
                .map_err(backend_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend_error)?;
            let mut by_id: HashMap<CaseId, CaseRow> =
                rows.into_iter().map(|row| (row.id, row)).collect();
            let ordered: Vec<CaseRow> = wanted.iter().filter_map(|id| by_id.remove(id)).collect();
            if ordered.len() < wanted.len() {
                warn!(
                    requested = wanted.len(),
                    found = ordered.len(),
                    "Some requested cases are missing from the store"
                );
            }
            Ok(ordered)
        })
        .await
    }
}

/// Backend answering discovery queries from substring rules.
///
/// The first rule whose needle occurs in the id list query wins; a query no
/// rule matches returns zero results. Every call is recorded.
#[derive(Default)]
pub struct ScriptedSearchBackend {
    rules: Mutex<Vec<(String, Vec<CaseId>)>>,
    failures: Mutex<Vec<String>>,
    rows: Mutex<HashMap<CaseId, CaseRow>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries containing `needle` with `ids`.
    pub fn with_rule(self, needle: impl Into<String>, ids: Vec<CaseId>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push((needle.into(), ids));
        }
        self
    }

    /// Fail queries containing `needle`.
    pub fn with_failure(self, needle: impl Into<String>) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(needle.into());
        }
        self
    }

    /// Serve a row for `rows_for_ids`.
    pub fn with_row(self, id: CaseId, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("content".into(), other);
                map
            }
        };
        if let Ok(mut rows) = self.rows.lock() {
            rows.insert(id, CaseRow { id, fields });
        }
        self
    }

    /// Id list queries seen so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SearchBackend for ScriptedSearchBackend {
    async fn run(
        &self,
        _count_query: &str,
        id_list_query: &str,
    ) -> Result<(usize, Vec<CaseId>), DiscoveryError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(id_list_query.to_string());
        }
        let failing = self
            .failures
            .lock()
            .map(|f| f.iter().any(|needle| id_list_query.contains(needle.as_str())))
            .unwrap_or(false);
        if failing {
            return Err(DiscoveryError::Backend {
                message: format!("scripted failure for: {id_list_query}"),
            });
        }
        let rules = self.rules.lock().map_err(backend_error)?;
        let ids = rules
            .iter()
            .find(|(needle, _)| id_list_query.contains(needle.as_str()))
            .map(|(_, ids)| ids.clone())
            .unwrap_or_default();
        Ok((ids.len(), ids))
    }

    async fn rows_for_ids(
        &self,
        ids: &[CaseId],
        _columns: &[String],
    ) -> Result<Vec<CaseRow>, DiscoveryError> {
        let rows = self.rows.lock().map_err(backend_error)?;
        Ok(ids
            .iter()
            .map(|id| {
                rows.get(id).cloned().unwrap_or_else(|| {
                    let mut fields = Map::new();
                    fields.insert("title".into(), Value::String(format!("Case {id}")));
                    CaseRow { id: *id, fields }
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(id: CaseId, title: &str, summary: &str) -> CaseRecord {
        CaseRecord {
            id,
            title: title.to_string(),
            court: Some("Curtea de Apel Cluj".to_string()),
            decision_date: Some(format!("2023-01-{:02}", id)),
            summary: Some(summary.to_string()),
            ..Default::default()
        }
    }

    async fn seeded() -> SqliteSearchBackend {
        let backend = SqliteSearchBackend::open_in_memory().unwrap();
        backend
            .insert_cases(vec![
                record(1, "Furt calificat noaptea", "Inculpatul a comis furt calificat"),
                record(2, "Talharie", "Talharie cu violenta"),
                record(3, "Furt simplu", "Furt din magazin"),
            ])
            .await
            .unwrap();
        backend
    }

    #[test]
    fn test_trigram_similarity_bounds() {
        assert!((trigram_similarity("furt", "furt") - 1.0).abs() < f64::EPSILON);
        assert_eq!(trigram_similarity("", ""), trigram_similarity("", ""));
        assert!(trigram_similarity("furt calificat", "talharie") < 0.2);
        assert!(trigram_similarity("Furt Calificat", "furt calificat") > 0.99);
    }

    #[test]
    fn test_read_only_guard() {
        assert!(is_read_only("SELECT id FROM cases"));
        assert!(is_read_only("  select count(*) from cases;"));
        assert!(!is_read_only("DELETE FROM cases"));
        assert!(!is_read_only("SELECT 1; DROP TABLE cases"));
    }

    #[tokio::test]
    async fn test_sqlite_run_like_query() {
        let backend = seeded().await;
        let (count, ids) = backend
            .run(
                "SELECT COUNT(*) FROM cases WHERE title LIKE '%furt%'",
                "SELECT id FROM cases WHERE title LIKE '%furt%' ORDER BY id",
            )
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_sqlite_fts_and_similarity() {
        let backend = seeded().await;
        let (_, ids) = backend
            .run(
                "SELECT COUNT(*) FROM cases JOIN cases_fts ON cases_fts.rowid = cases.id WHERE cases_fts MATCH '\"furt calificat\"'",
                "SELECT cases.id FROM cases JOIN cases_fts ON cases_fts.rowid = cases.id WHERE cases_fts MATCH '\"furt calificat\"' ORDER BY cases_fts.rank",
            )
            .await
            .unwrap();
        assert_eq!(ids, vec![1]);

        let (_, ids) = backend
            .run(
                "SELECT COUNT(*) FROM cases WHERE trigram_similarity(title, 'talharie') >= 0.5",
                "SELECT id FROM cases WHERE trigram_similarity(title, 'talharie') >= 0.5",
            )
            .await
            .unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_sqlite_rejects_writes() {
        let backend = seeded().await;
        let result = backend
            .run("SELECT COUNT(*) FROM cases", "DELETE FROM cases")
            .await;
        assert!(matches!(result, Err(DiscoveryError::Backend { .. })));
    }

    #[tokio::test]
    async fn test_sqlite_rows_preserve_request_order() {
        let backend = seeded().await;
        let rows = backend
            .rows_for_ids(&[3, 1, 99], &["title".to_string(), "bogus".to_string()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 3);
        assert_eq!(rows[1].id, 1);
        assert_eq!(rows[0].fields.get("title"), Some(&Value::from("Furt simplu")));
        assert!(!rows[0].fields.contains_key("bogus"));
    }

    #[tokio::test]
    async fn test_sqlite_rows_surface_unreadable_rows() {
        // A store created elsewhere with a non-integer id column.
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE cases (id REAL, title TEXT, court TEXT, decision_date TEXT,
                                 keywords TEXT, summary TEXT, content TEXT);
             INSERT INTO cases (id, title) VALUES (1, 'Furt');",
        )
        .unwrap();
        let backend = SqliteSearchBackend::from_connection(conn).unwrap();
        let result = backend.rows_for_ids(&[1], &[]).await;
        assert!(matches!(result, Err(DiscoveryError::Backend { .. })));
    }

    #[tokio::test]
    async fn test_sqlite_abandoned_query_frees_connection() {
        let backend = seeded().await;
        let endless = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                       SELECT COUNT(*) FROM (SELECT x FROM c LIMIT 4000000000)";
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            backend.run(endless, "SELECT id FROM cases"),
        )
        .await;
        assert!(abandoned.is_err());

        let (count, ids) = tokio::time::timeout(
            Duration::from_secs(10),
            backend.run("SELECT COUNT(*) FROM cases", "SELECT id FROM cases ORDER BY id"),
        )
        .await
        .expect("connection released after the abandoned query")
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_scripted_backend_rules() {
        let backend = ScriptedSearchBackend::new()
            .with_rule("MATCH", vec![4, 5])
            .with_failure("trigram_similarity");
        let (count, ids) = backend.run("", "... cases_fts MATCH ...").await.unwrap();
        assert_eq!((count, ids), (2, vec![4, 5]));
        assert!(backend.run("", "trigram_similarity(x)").await.is_err());
        assert_eq!(backend.run("", "LIKE").await.unwrap().0, 0);
        assert_eq!(backend.calls().len(), 3);
    }
}
