// store/pool.rs
// Async connection pools using deadpool-sqlite
//
// The store opens two pools over the same database: a writer pool capped at
// one connection (all writes are totally ordered per §ordering of the
// concurrency model) and a reader pool for concurrent lookups. WAL mode
// lets readers proceed while the writer holds its lock.
//
// In-memory databases use a shared cache URI so both pools (and any direct
// test connection) observe the same state.

use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Reader pool size. The writer pool is always 1.
const READER_POOL_SIZE: usize = 8;

/// Dual-pool wrapper around the embedded database.
pub struct StorePool {
    readers: Pool,
    writer: Pool,
    path: Option<PathBuf>,
    /// URI for in-memory databases (used to share state in tests)
    memory_uri: Option<String>,
}

/// Whether to use a file path or a shared in-memory URI.
enum DbStorage {
    File(PathBuf),
    InMemory,
}

impl StorePool {
    /// Open pooled connections to the database at the given path, running
    /// migrations on the writer connection.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf())).await
    }

    /// Open a pooled in-memory database (for tests).
    ///
    /// Uses a shared cache URI so all connections access the same in-memory
    /// database. Without shared cache, each pooled connection would get its
    /// own separate empty database.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_internal(DbStorage::InMemory).await
    }

    async fn open_internal(storage: DbStorage) -> Result<Self> {
        let (conn_str, path, memory_uri) = match storage {
            DbStorage::File(p) => {
                ensure_parent_directory(&p)?;
                (p.to_string_lossy().into_owned(), Some(p), None)
            }
            DbStorage::InMemory => {
                let uri = format!("file:memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
                (uri.clone(), None, Some(uri))
            }
        };

        let in_memory = memory_uri.is_some();
        let writer = build_pool(&conn_str, 1, in_memory)?;
        let readers = build_pool(&conn_str, READER_POOL_SIZE, in_memory)?;

        let pool = Self {
            readers,
            writer,
            path,
            memory_uri,
        };

        // Migrations run under the writer lock before anything else touches
        // the schema.
        pool.write(|conn| super::schema::run_migrations(conn))
            .await
            .context("Failed to run migrations")?;

        Ok(pool)
    }

    /// Get the shared-cache URI (for sharing state with test connections).
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure on a reader connection.
    ///
    /// The closure runs on a blocking thread pool, so it won't block the
    /// async runtime.
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        interact(&self.readers, f).await
    }

    /// Run a closure on the writer connection. Writes are serialized; a
    /// second writer waits in the pool queue rather than hitting
    /// SQLITE_BUSY.
    pub async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        interact(&self.writer, f).await
    }

    /// Ping both pools. Used by the readiness probe.
    pub async fn ready(&self) -> Result<()> {
        self.read(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .context("reader ping failed")?;
        self.write(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
        .context("writer ping failed")?;
        Ok(())
    }
}

async fn interact<F, R>(pool: &Pool, f: F) -> Result<R>
where
    F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let conn = pool
        .get()
        .await
        .context("Failed to get connection from pool")?;
    conn.interact(move |conn| f(conn))
        .await
        .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
}

fn build_pool(conn_str: &str, max_size: usize, in_memory: bool) -> Result<Pool> {
    let cfg = Config::new(conn_str);
    cfg.builder(Runtime::Tokio1)
        .context("Failed to create pool builder")?
        .max_size(max_size)
        .post_create(make_post_create_hook(in_memory))
        .build()
        .context("Failed to build connection pool")
}

/// Per-connection setup hook. WAL is skipped for in-memory databases (not
/// applicable there).
fn make_post_create_hook(in_memory: bool) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            conn.interact(move |conn| setup_connection(conn, in_memory))
                .await
                .map_err(|e| {
                    deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
                })?
                .map_err(|e| {
                    deadpool_sqlite::HookError::Message(
                        format!("connection setup failed: {e}").into(),
                    )
                })
        })
    })
}

fn setup_connection(conn: &Connection, in_memory: bool) -> rusqlite::Result<()> {
    if in_memory {
        conn.execute_batch(
            "PRAGMA foreign_keys=ON; \
             PRAGMA busy_timeout=5000;",
        )?;
    } else {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA foreign_keys=ON; \
             PRAGMA busy_timeout=5000; \
             PRAGMA synchronous=NORMAL; \
             PRAGMA journal_size_limit=32768;",
        )?;
    }
    Ok(())
}

/// Ensure parent directory exists with restricted permissions (0o700 on Unix).
fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(parent, perms)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_in_memory_shared_state() {
        let pool = StorePool::open_in_memory()
            .await
            .expect("Failed to open in-memory pool");

        pool.write(|conn| {
            conn.execute(
                "INSERT INTO students (id, name, year, department, cached_at) \
                 VALUES ('41247001', '陳小明', 112, '資工系', 1)",
                [],
            )?;
            Ok(())
        })
        .await
        .expect("insert failed");

        // Read from the other pool (tests shared cache)
        let name: String = pool
            .read(|conn| {
                conn.query_row(
                    "SELECT name FROM students WHERE id = '41247001'",
                    [],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .await
            .expect("query failed");

        assert_eq!(name, "陳小明");
    }

    #[tokio::test]
    async fn test_ready_pings_both_pools() {
        let pool = StorePool::open_in_memory().await.expect("open failed");
        pool.ready().await.expect("ready should succeed");
    }

    #[tokio::test]
    async fn test_serialized_writes() {
        let pool = std::sync::Arc::new(StorePool::open_in_memory().await.expect("open failed"));

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.write(move |conn| {
                    conn.execute(
                        "INSERT INTO students (id, name, year, department, cached_at) \
                         VALUES (?1, ?2, 112, '資工系', 1)",
                        rusqlite::params![format!("4124700{i}"), format!("student-{i}")],
                    )?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().expect("write failed");
        }

        let count: i64 = pool
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
            .expect("count failed");
        assert_eq!(count, 10);
    }
}
