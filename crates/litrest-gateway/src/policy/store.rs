//! Persistence of row-level policies
//!
//! Each database carries its own `_policies` table. Its shape is part of
//! the on-disk contract; changing it requires a migration.

use rusqlite::Connection;

use litrest_common::{GatewayError, Result};

use crate::pool::map_sqlite_err;

/// The action a policy governs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
    All,
}

impl Action {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SELECT" => Ok(Self::Select),
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "ALL" => Ok(Self::All),
            other => Err(GatewayError::Validation(format!(
                "unknown policy action: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::All => "ALL",
        }
    }
}

/// One stored policy row, expression still unparsed
#[derive(Debug, Clone)]
pub struct PolicyRecord {
    pub name: String,
    pub table: String,
    pub action: Action,
    pub expression: String,
    pub description: Option<String>,
}

const POLICY_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS _policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    table_name TEXT NOT NULL,
    action TEXT NOT NULL CHECK (action IN ('SELECT', 'INSERT', 'UPDATE', 'DELETE', 'ALL')),
    expression TEXT NOT NULL,
    description TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// Create the policy table when absent
pub fn ensure_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(POLICY_TABLE_DDL).map_err(map_sqlite_err)
}

/// Whether the policy table exists (read-only databases may lack it)
pub fn table_exists(conn: &Connection) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_policies'",
        [],
        |row| row.get::<_, i64>(0).map(|n| n > 0),
    )
    .map_err(map_sqlite_err)
}

/// Load every enabled policy, ordered by name for deterministic
/// application order
pub fn load_enabled(conn: &Connection) -> Result<Vec<PolicyRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT name, table_name, action, expression, description \
             FROM _policies WHERE enabled = 1 ORDER BY name",
        )
        .map_err(map_sqlite_err)?;
    let mut rows = stmt.query([]).map_err(map_sqlite_err)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqlite_err)? {
        let action: String = row.get(2).map_err(map_sqlite_err)?;
        records.push(PolicyRecord {
            name: row.get(0).map_err(map_sqlite_err)?,
            table: row.get(1).map_err(map_sqlite_err)?,
            action: Action::parse(&action)?,
            expression: row.get(3).map_err(map_sqlite_err)?,
            description: row.get(4).map_err(map_sqlite_err)?,
        });
    }
    Ok(records)
}

pub fn is_empty(conn: &Connection) -> Result<bool> {
    conn.query_row("SELECT COUNT(*) FROM _policies", [], |row| {
        row.get::<_, i64>(0).map(|n| n == 0)
    })
    .map_err(map_sqlite_err)
}

/// Insert the demo policy set, skipping names that already exist
pub fn seed_defaults(conn: &Connection) -> Result<usize> {
    let defaults: &[(&str, &str, &str, &str, &str)] = &[
        (
            "users_select_own",
            "users",
            "SELECT",
            "id = current_user_id() OR current_role() = 'admin'",
            "Users see their own profile, admins see all",
        ),
        (
            "users_update_own",
            "users",
            "UPDATE",
            "id = current_user_id() OR current_role() = 'admin'",
            "Users update their own profile, admins update all",
        ),
        (
            "users_delete_admin_only",
            "users",
            "DELETE",
            "current_role() = 'admin'",
            "Only admins delete users",
        ),
        (
            "posts_select_public_or_own",
            "posts",
            "SELECT",
            "is_public = TRUE OR author_id = current_user_id() OR current_role() = 'admin'",
            "Public posts for everyone, own posts for authors, all for admins",
        ),
        (
            "posts_insert_authenticated",
            "posts",
            "INSERT",
            "current_user_id() IS NOT NULL",
            "Only authenticated users create posts",
        ),
    ];

    let mut inserted = 0;
    for (name, table, action, expression, description) in defaults {
        inserted += conn
            .execute(
                "INSERT OR IGNORE INTO _policies \
                 (name, table_name, action, expression, description) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![name, table, action, expression, description],
            )
            .map_err(map_sqlite_err)?;
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_round_trips_and_orders_by_name() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn).unwrap();
        assert!(is_empty(&conn).unwrap());

        conn.execute(
            "INSERT INTO _policies (name, table_name, action, expression) \
             VALUES ('z_last', 't', 'SELECT', 'id = 1'), \
                    ('a_first', 't', 'ALL', 'id = 2')",
            [],
        )
        .unwrap();

        let records = load_enabled(&conn).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "a_first");
        assert_eq!(records[0].action, Action::All);
        assert_eq!(records[1].name, "z_last");
    }

    #[test]
    fn disabled_policies_are_skipped() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn).unwrap();
        conn.execute(
            "INSERT INTO _policies (name, table_name, action, expression, enabled) \
             VALUES ('off', 't', 'SELECT', 'id = 1', 0)",
            [],
        )
        .unwrap();
        assert!(load_enabled(&conn).unwrap().is_empty());
    }

    #[test]
    fn action_check_constraint_holds() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn).unwrap();
        let err = conn.execute(
            "INSERT INTO _policies (name, table_name, action, expression) \
             VALUES ('bad', 't', 'TRUNCATE', '1')",
            [],
        );
        assert!(err.is_err());
    }

    #[test]
    fn seeding_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn).unwrap();
        assert_eq!(seed_defaults(&conn).unwrap(), 5);
        assert_eq!(seed_defaults(&conn).unwrap(), 0);
    }
}
