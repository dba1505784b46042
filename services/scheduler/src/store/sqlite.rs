//! SQLite-backed desired-state store.
//!
//! Snapshots are stored as JSON values in a single key-value table, one row
//! per project. Each put is a single upsert statement, so a snapshot is
//! either fully written or not at all.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mc_id::FrameworkId;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{ProjectSnapshot, StateStore, StoreError};

const PROJECT_PREFIX: &str = "project/";
const FRAMEWORK_ID_KEY: &str = "framework/id";

/// SQLite state store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("create {}: {e}", parent.display())))?;
            }
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn project_key(project: &str) -> String {
    format!("{PROJECT_PREFIX}{project}")
}

fn write_value(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, chrono::Utc::now().timestamp()],
    )?;
    Ok(())
}

fn read_value(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
        .map_err(Into::into)
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn put(&self, snapshot: &ProjectSnapshot) -> Result<(), StoreError> {
        let key = project_key(&snapshot.project);
        let value = serde_json::to_string(snapshot)?;
        self.with_conn(move |conn| write_value(conn, &key, &value)).await
    }

    async fn get(&self, project: &str) -> Result<Option<ProjectSnapshot>, StoreError> {
        let key = project_key(project);
        let raw = self.with_conn(move |conn| read_value(conn, &key)).await?;
        raw.map(|v| serde_json::from_str(&v).map_err(Into::into)).transpose()
    }

    async fn delete(&self, project: &str) -> Result<bool, StoreError> {
        let key = project_key(project);
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<ProjectSnapshot>, StoreError> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT value FROM kv WHERE key LIKE ?1 ORDER BY key")?;
                let rows = stmt
                    .query_map(params![format!("{PROJECT_PREFIX}%")], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|v| serde_json::from_str(v).map_err(Into::into))
            .collect()
    }

    async fn framework_id(&self) -> Result<Option<FrameworkId>, StoreError> {
        let raw = self
            .with_conn(|conn| read_value(conn, FRAMEWORK_ID_KEY))
            .await?;
        Ok(raw.and_then(|v| FrameworkId::parse(&v).ok()))
    }

    async fn set_framework_id(&self, id: &FrameworkId) -> Result<(), StoreError> {
        let value = id.to_string();
        self.with_conn(move |conn| write_value(conn, FRAMEWORK_ID_KEY, &value))
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{parse, ParseOptions};

    fn snapshot(project: &str, yaml: &str) -> ProjectSnapshot {
        let doc = parse(yaml.as_bytes(), &ParseOptions::default()).unwrap();
        let services = doc
            .services
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        ProjectSnapshot::new(project, "3").next(&doc.version, services)
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_is_field_for_field() {
        let store = SqliteStore::open_in_memory().unwrap();
        let original = snapshot(
            "shop",
            r#"
services:
  web:
    image: nginx:1.27
    command: ["nginx", "-g", "daemon off;"]
    environment: {A: "1", B: "two"}
    labels: {mesos_compose.placement.hostname: "node*", team: web}
    ports: ["8080:80"]
    volumes: ["data:/data:ro"]
    deploy:
      replicas: 2
      resources: {limits: {cpus: 0.25, memory: 256m}}
  worker:
    image: busybox
    entrypoint: /bin/worker
    restart: on-failure
"#,
        );

        store.put(&original).await.unwrap();
        let loaded = store.get("shop").await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_put_replaces_and_list_orders_by_project() {
        let store = SqliteStore::open_in_memory().unwrap();
        let b = snapshot("b", "services:\n  s:\n    image: x\n    command: y\n");
        let a = snapshot("a", "services:\n  s:\n    image: x\n    command: y\n");
        store.put(&b).await.unwrap();
        store.put(&a).await.unwrap();
        let b2 = b.next("3", b.services.clone());
        store.put(&b2).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.iter().map(|s| s.project.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(all[1].version, 2);
    }

    #[tokio::test]
    async fn test_framework_id_not_listed_as_project() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.framework_id().await.unwrap().is_none());

        let id = FrameworkId::parse("fw-0001").unwrap();
        store.set_framework_id(&id).await.unwrap();
        assert_eq!(store.framework_id().await.unwrap(), Some(id));
        assert!(store.list().await.unwrap().is_empty());
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let snap = snapshot("shop", "services:\n  s:\n    image: x\n    command: y\n");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&snap).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("shop").await.unwrap(), Some(snap));
        assert!(store.delete("shop").await.unwrap());
        assert!(store.get("shop").await.unwrap().is_none());
    }
}
