//! Connection pools for attached SQLite databases
//!
//! Each attached database owns exactly one writer connection (none in
//! read-only mode) and a bounded set of reader connections. Writes across a
//! database are totally ordered by the writer lock; reads run concurrently
//! under a semaphore. Every borrow is guard-scoped so the connection returns
//! to the pool on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use litrest_common::{validate_ident, AccessMode, GatewayError, PoolConfig, Result};

/// Writer-acquisition retry schedule: bounded, exponential
const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BASE: Duration = Duration::from_millis(50);

/// Point-in-time description of one attached database
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseStatus {
    pub name: String,
    pub path: String,
    pub mode: AccessMode,
    pub readers: usize,
    pub has_writer: bool,
}

/// Owns every attached database and its connections
pub struct PoolManager {
    databases: RwLock<HashMap<String, Arc<DatabaseHandle>>>,
    config: PoolConfig,
}

struct DatabaseHandle {
    name: String,
    path: String,
    mode: AccessMode,
    writer: Option<Mutex<Connection>>,
    readers: Arc<ReaderPool>,
}

struct ReaderPool {
    permits: Arc<Semaphore>,
    idle: parking_lot::Mutex<Vec<Connection>>,
    total: usize,
}

/// Scoped reader borrow; returns the connection to the pool on drop,
/// including on panic inside the caller's closure.
struct ReaderGuard {
    conn: Option<Connection>,
    pool: Arc<ReaderPool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Attach every database listed in the configuration
    pub async fn from_config(
        pool: PoolConfig,
        databases: &[litrest_common::DatabaseConfig],
    ) -> Result<Self> {
        let manager = Self::new(pool);
        for db in databases {
            manager.attach(&db.name, &db.path, db.mode).await?;
        }
        Ok(manager)
    }

    /// Attach a database under `name`. Fails if the name is already taken.
    pub async fn attach(&self, name: &str, path: &str, mode: AccessMode) -> Result<()> {
        validate_ident(name)?;

        let mut databases = self.databases.write().await;
        if databases.contains_key(name) {
            return Err(GatewayError::Conflict(format!(
                "database already attached: {name}"
            )));
        }

        let reader_count = self.config.clamped_readers();
        let busy_ms = self.config.busy_timeout_ms;

        // Writer first: in read-write and in-memory modes it creates the
        // store the readers open.
        let writer = match mode {
            AccessMode::ReadOnly => None,
            AccessMode::ReadWrite | AccessMode::InMemory => {
                Some(Mutex::new(open_connection(name, path, mode, false, busy_ms)?))
            }
        };

        let mut idle = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            idle.push(open_connection(name, path, mode, true, busy_ms)?);
        }

        let handle = DatabaseHandle {
            name: name.to_string(),
            path: path.to_string(),
            mode,
            writer,
            readers: Arc::new(ReaderPool {
                permits: Arc::new(Semaphore::new(reader_count)),
                idle: parking_lot::Mutex::new(idle),
                total: reader_count,
            }),
        };

        info!(db = name, ?mode, readers = reader_count, "attached database");
        databases.insert(name.to_string(), Arc::new(handle));
        Ok(())
    }

    /// Detach `name`: new requests fail immediately with `not_found`;
    /// in-flight closures get until the busy deadline to finish before the
    /// connections are torn down.
    pub async fn detach(&self, name: &str) -> Result<()> {
        let handle = {
            let mut databases = self.databases.write().await;
            databases
                .remove(name)
                .ok_or_else(|| GatewayError::DatabaseNotFound(name.to_string()))?
        };

        let deadline = Duration::from_millis(self.config.busy_timeout_ms);

        // Wait for every reader to come home, then close the pool so late
        // acquires fail instead of hanging.
        let total = handle.readers.total as u32;
        match tokio::time::timeout(deadline, handle.readers.permits.acquire_many(total)).await {
            Ok(Ok(permits)) => permits.forget(),
            Ok(Err(_)) => {}
            Err(_) => warn!(db = name, "detach deadline expired with readers in flight"),
        }
        handle.readers.permits.close();
        handle.readers.idle.lock().clear();

        if let Some(writer) = &handle.writer {
            if tokio::time::timeout(deadline, writer.lock()).await.is_err() {
                warn!(db = name, "detach deadline expired with a write in flight");
            }
        }

        info!(db = name, "detached database");
        Ok(())
    }

    /// Borrow an idle reader for the duration of `f`
    pub async fn read<T>(
        &self,
        db: &str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let handle = self.handle(db).await?;
        let deadline = Duration::from_millis(self.config.busy_timeout_ms);

        let permit = tokio::time::timeout(
            deadline,
            Arc::clone(&handle.readers.permits).acquire_owned(),
        )
        .await
        .map_err(|_| GatewayError::Busy(format!("no idle reader for {db}")))?
        .map_err(|_| GatewayError::DatabaseNotFound(db.to_string()))?;

        let conn = handle
            .readers
            .idle
            .lock()
            .pop()
            .ok_or_else(|| GatewayError::Database("reader pool accounting error".to_string()))?;

        let guard = ReaderGuard {
            conn: Some(conn),
            pool: Arc::clone(&handle.readers),
            _permit: permit,
        };
        f(guard.conn.as_ref().expect("guard holds the connection"))
    }

    /// Acquire the exclusive writer slot for the duration of `f`.
    ///
    /// Acquisition timeouts are retried with bounded exponential backoff;
    /// everything else surfaces to the caller.
    pub async fn write<T>(
        &self,
        db: &str,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let handle = self.handle(db).await?;
        let writer = handle.writer.as_ref().ok_or_else(|| {
            GatewayError::Validation(format!("database {db} is read-only"))
        })?;

        let deadline = Duration::from_millis(self.config.busy_timeout_ms);
        let mut backoff = WRITE_RETRY_BASE;
        for attempt in 0..WRITE_RETRY_ATTEMPTS {
            match tokio::time::timeout(deadline, writer.lock()).await {
                Ok(mut conn) => return f(&mut conn),
                Err(_) if attempt + 1 < WRITE_RETRY_ATTEMPTS => {
                    debug!(db, attempt, "writer slot busy, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(_) => break,
            }
        }
        Err(GatewayError::Busy(format!("writer slot for {db}")))
    }

    pub async fn contains(&self, db: &str) -> bool {
        self.databases.read().await.contains_key(db)
    }

    pub async fn mode(&self, db: &str) -> Result<AccessMode> {
        Ok(self.handle(db).await?.mode)
    }

    pub async fn list(&self) -> Vec<DatabaseStatus> {
        let databases = self.databases.read().await;
        let mut out: Vec<DatabaseStatus> = databases
            .values()
            .map(|h| DatabaseStatus {
                name: h.name.clone(),
                path: h.path.clone(),
                mode: h.mode,
                readers: h.readers.total,
                has_writer: h.writer.is_some(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    async fn handle(&self, db: &str) -> Result<Arc<DatabaseHandle>> {
        self.databases
            .read()
            .await
            .get(db)
            .cloned()
            .ok_or_else(|| GatewayError::DatabaseNotFound(db.to_string()))
    }
}

/// Open one SQLite connection in the requested role.
///
/// File databases run write-ahead journaling with NORMAL sync; every
/// connection enforces foreign keys and a busy handler.
fn open_connection(
    name: &str,
    path: &str,
    mode: AccessMode,
    reader: bool,
    busy_ms: u64,
) -> Result<Connection> {
    let conn = match mode {
        AccessMode::InMemory => {
            // Shared cache keeps every pool member on the same store
            let uri = format!("file:{name}?mode=memory&cache=shared");
            let flags = if reader {
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX
            } else {
                OpenFlags::default()
            };
            Connection::open_with_flags(&uri, flags)
        }
        AccessMode::ReadOnly => Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ),
        AccessMode::ReadWrite => {
            if reader {
                Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
            } else {
                Connection::open(path)
            }
        }
    }
    .map_err(map_sqlite_err)?;

    let mut pragmas = String::new();
    if mode == AccessMode::ReadWrite && !reader {
        pragmas.push_str("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; ");
    }
    pragmas.push_str(&format!(
        "PRAGMA foreign_keys=ON; PRAGMA busy_timeout={busy_ms};"
    ));
    conn.execute_batch(&pragmas).map_err(map_sqlite_err)?;

    Ok(conn)
}

/// Translate engine failures into the gateway taxonomy
pub fn map_sqlite_err(err: rusqlite::Error) -> GatewayError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) => match e.code {
            rusqlite::ErrorCode::ConstraintViolation => GatewayError::Conflict(
                msg.clone().unwrap_or_else(|| "constraint violation".to_string()),
            ),
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                GatewayError::Busy(msg.clone().unwrap_or_else(|| "database locked".to_string()))
            }
            _ => GatewayError::Database(err.to_string()),
        },
        _ => GatewayError::Database(err.to_string()),
    }
}
