//! Introspected table schemas with a TTL cache
//!
//! One partition per attached database. Entries are served while younger
//! than the TTL; a miss re-introspects under the partition write guard so
//! `invalidate` is linearizable with respect to `get`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::RwLock;
use tracing::debug;

use litrest_common::{quote_ident, validate_ident, GatewayError, Result};

use crate::pool::{map_sqlite_err, PoolManager};

/// One column of an introspected table
#[derive(Debug, Clone, serde::Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// One outgoing foreign-key edge
#[derive(Debug, Clone, serde::Serialize)]
pub struct ForeignKey {
    pub from_column: String,
    pub ref_table: String,
    /// None when the edge references the foreign table's implicit primary key
    pub ref_column: Option<String>,
    pub on_update: String,
    pub on_delete: String,
}

/// One secondary index (the implicit primary-key index is skipped)
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Introspected description of one table
#[derive(Debug, Clone, serde::Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexInfo>,
    #[serde(skip)]
    pub captured_at: Instant,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Single-column INTEGER primary key, if the table has one (the
    /// rowid-alias case where SQLite auto-assigns values)
    pub fn auto_primary_key(&self) -> Option<&ColumnInfo> {
        let pks: Vec<&ColumnInfo> = self.columns.iter().filter(|c| c.primary_key).collect();
        match pks.as_slice() {
            [only] if only.decl_type.eq_ignore_ascii_case("integer") => Some(only),
            _ => None,
        }
    }

    /// First foreign-key edge pointing at `table`
    pub fn foreign_key_to(&self, table: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.ref_table == table)
    }
}

/// Cache demographics for one database partition
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub tables: Vec<String>,
    pub oldest_age_secs: Option<u64>,
    pub newest_age_secs: Option<u64>,
}

/// TTL-bounded memoization of table introspection
pub struct SchemaCache {
    pools: Arc<PoolManager>,
    ttl: Duration,
    partitions: RwLock<HashMap<String, HashMap<String, Arc<TableSchema>>>>,
}

impl SchemaCache {
    pub fn new(pools: Arc<PoolManager>, ttl: Duration) -> Self {
        Self {
            pools,
            ttl,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the schema for `table`, introspecting on miss or expiry.
    ///
    /// Introspection never partially commits: on failure the prior entry
    /// stays in place.
    pub async fn get(&self, db: &str, table: &str) -> Result<Arc<TableSchema>> {
        validate_ident(table)?;

        {
            let partitions = self.partitions.read().await;
            if let Some(entry) = partitions.get(db).and_then(|p| p.get(table)) {
                if entry.captured_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(entry));
                }
            }
        }

        let mut partitions = self.partitions.write().await;
        // Double-check: another task may have refreshed while we waited
        if let Some(entry) = partitions.get(db).and_then(|p| p.get(table)) {
            if entry.captured_at.elapsed() < self.ttl {
                return Ok(Arc::clone(entry));
            }
        }

        let schema = Arc::new(self.introspect(db, table).await?);
        debug!(db, table, "schema introspected");
        partitions
            .entry(db.to_string())
            .or_default()
            .insert(table.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Drop one table's entry, or a whole database partition
    pub async fn invalidate(&self, db: &str, table: Option<&str>) {
        let mut partitions = self.partitions.write().await;
        match table {
            Some(t) => {
                if let Some(partition) = partitions.get_mut(db) {
                    partition.remove(t);
                }
            }
            None => {
                partitions.remove(db);
            }
        }
    }

    pub async fn stats(&self, db: &str) -> CacheStats {
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(db) else {
            return CacheStats {
                count: 0,
                tables: Vec::new(),
                oldest_age_secs: None,
                newest_age_secs: None,
            };
        };
        let mut tables: Vec<String> = partition.keys().cloned().collect();
        tables.sort();
        let ages: Vec<u64> = partition
            .values()
            .map(|s| s.captured_at.elapsed().as_secs())
            .collect();
        CacheStats {
            count: partition.len(),
            tables,
            oldest_age_secs: ages.iter().max().copied(),
            newest_age_secs: ages.iter().min().copied(),
        }
    }

    async fn introspect(&self, db: &str, table: &str) -> Result<TableSchema> {
        let table = table.to_string();
        self.pools
            .read(db, move |conn| introspect_table(conn, &table))
            .await
    }
}

/// Run the catalog pragmas for one table
fn introspect_table(conn: &Connection, table: &str) -> Result<TableSchema> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )
        .map_err(map_sqlite_err)?;
    if !exists {
        return Err(GatewayError::TableNotFound(table.to_string()));
    }

    let quoted = quote_ident(table);

    let mut columns = Vec::new();
    {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({quoted})"))
            .map_err(map_sqlite_err)?;
        let mut rows = stmt.query([]).map_err(map_sqlite_err)?;
        while let Some(row) = rows.next().map_err(map_sqlite_err)? {
            let pk_position: i64 = row.get(5).map_err(map_sqlite_err)?;
            columns.push(ColumnInfo {
                name: row.get(1).map_err(map_sqlite_err)?,
                decl_type: row.get(2).map_err(map_sqlite_err)?,
                not_null: row.get::<_, i64>(3).map_err(map_sqlite_err)? != 0,
                default_value: row.get(4).map_err(map_sqlite_err)?,
                primary_key: pk_position > 0,
            });
        }
    }
    if columns.is_empty() {
        return Err(GatewayError::TableNotFound(table.to_string()));
    }

    let mut foreign_keys = Vec::new();
    {
        let mut stmt = conn
            .prepare(&format!("PRAGMA foreign_key_list({quoted})"))
            .map_err(map_sqlite_err)?;
        let mut rows = stmt.query([]).map_err(map_sqlite_err)?;
        while let Some(row) = rows.next().map_err(map_sqlite_err)? {
            foreign_keys.push(ForeignKey {
                ref_table: row.get(2).map_err(map_sqlite_err)?,
                from_column: row.get(3).map_err(map_sqlite_err)?,
                ref_column: row.get(4).map_err(map_sqlite_err)?,
                on_update: row.get(5).map_err(map_sqlite_err)?,
                on_delete: row.get(6).map_err(map_sqlite_err)?,
            });
        }
    }

    let mut indexes = Vec::new();
    {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({quoted})"))
            .map_err(map_sqlite_err)?;
        let mut rows = stmt.query([]).map_err(map_sqlite_err)?;
        while let Some(row) = rows.next().map_err(map_sqlite_err)? {
            let origin: String = row.get(3).map_err(map_sqlite_err)?;
            // Skip the implicit primary-key index
            if origin == "pk" {
                continue;
            }
            indexes.push(IndexInfo {
                name: row.get(1).map_err(map_sqlite_err)?,
                unique: row.get::<_, i64>(2).map_err(map_sqlite_err)? != 0,
                columns: Vec::new(),
            });
        }
    }
    for index in &mut indexes {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_info({})", quote_ident(&index.name)))
            .map_err(map_sqlite_err)?;
        let mut rows = stmt.query([]).map_err(map_sqlite_err)?;
        while let Some(row) = rows.next().map_err(map_sqlite_err)? {
            // Expression index members have no column name
            if let Some(name) = row.get::<_, Option<String>>(2).map_err(map_sqlite_err)? {
                index.columns.push(name);
            }
        }
    }

    Ok(TableSchema {
        name: table.to_string(),
        columns,
        foreign_keys,
        indexes,
        captured_at: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use litrest_common::{AccessMode, PoolConfig};

    async fn seeded_pool(name: &str) -> Arc<PoolManager> {
        let pool = Arc::new(PoolManager::new(PoolConfig {
            readers_per_db: 2,
            busy_timeout_ms: 500,
        }));
        pool.attach(name, "", AccessMode::InMemory).await.unwrap();
        pool.write(name, |conn| {
            conn.execute_batch(
                "CREATE TABLE users (
                     id INTEGER PRIMARY KEY,
                     name TEXT NOT NULL,
                     age INTEGER DEFAULT 18
                 );
                 CREATE TABLE posts (
                     id INTEGER PRIMARY KEY,
                     author_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
                     title TEXT
                 );
                 CREATE INDEX idx_posts_author ON posts (author_id);",
            )
            .map_err(map_sqlite_err)
        })
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn introspects_columns_keys_and_indexes() {
        let pool = seeded_pool("s1").await;
        let cache = SchemaCache::new(pool, Duration::from_secs(300));

        let users = cache.get("s1", "users").await.unwrap();
        assert_eq!(users.columns.len(), 3);
        assert!(users.column("id").unwrap().primary_key);
        assert!(users.column("name").unwrap().not_null);
        assert_eq!(
            users.column("age").unwrap().default_value.as_deref(),
            Some("18")
        );
        assert!(users.auto_primary_key().is_some());

        let posts = cache.get("s1", "posts").await.unwrap();
        let fk = posts.foreign_key_to("users").unwrap();
        assert_eq!(fk.from_column, "author_id");
        assert_eq!(fk.ref_column.as_deref(), Some("id"));
        assert_eq!(fk.on_delete, "CASCADE");
        assert_eq!(posts.indexes.len(), 1);
        assert_eq!(posts.indexes[0].columns, vec!["author_id"]);
    }

    #[tokio::test]
    async fn unknown_table_is_not_found() {
        let pool = seeded_pool("s2").await;
        let cache = SchemaCache::new(pool, Duration::from_secs(300));
        let err = cache.get("s2", "ghosts").await.unwrap_err();
        assert_eq!(err.kind(), litrest_common::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn entries_are_cached_until_invalidated() {
        let pool = seeded_pool("s3").await;
        let cache = SchemaCache::new(Arc::clone(&pool), Duration::from_secs(300));

        cache.get("s3", "users").await.unwrap();
        let stats = cache.stats("s3").await;
        assert_eq!(stats.count, 1);
        assert_eq!(stats.tables, vec!["users"]);

        // A column added behind the cache's back stays invisible until
        // invalidation
        pool.write("s3", |conn| {
            conn.execute_batch("ALTER TABLE users ADD COLUMN email TEXT")
                .map_err(map_sqlite_err)
        })
        .await
        .unwrap();
        assert!(!cache.get("s3", "users").await.unwrap().has_column("email"));

        cache.invalidate("s3", Some("users")).await;
        assert!(cache.get("s3", "users").await.unwrap().has_column("email"));
    }

    #[tokio::test]
    async fn expired_entries_are_reintrospected() {
        let pool = seeded_pool("s4").await;
        let cache = SchemaCache::new(Arc::clone(&pool), Duration::from_millis(0));

        cache.get("s4", "users").await.unwrap();
        pool.write("s4", |conn| {
            conn.execute_batch("ALTER TABLE users ADD COLUMN bio TEXT")
                .map_err(map_sqlite_err)
        })
        .await
        .unwrap();
        // TTL of zero means every get re-introspects
        assert!(cache.get("s4", "users").await.unwrap().has_column("bio"));
    }
}
