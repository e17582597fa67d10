//! Row-level policy engine
//!
//! Policies load at startup and on explicit reload, with every expression
//! parsed eagerly. Readers take an `Arc` snapshot of the loaded set;
//! reloads publish a fresh pointer, so a half-loaded set is never visible.
//! Applicable policies compose with OR and conjoin into the plan's WHERE;
//! admins bypass, and an empty set falls back to the configured default.

pub mod expr;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use litrest_common::{DefaultAction, GatewayError, Result};

use crate::auth::Principal;
use crate::engine::plan::{Plan, PolicyClause};
use crate::engine::schema::TableSchema;
use crate::pool::PoolManager;

pub use expr::Expr;
pub use store::{Action, PolicyRecord};

/// Role that bypasses every policy
const ADMIN_ROLE: &str = "admin";

/// One policy with its expression parsed
#[derive(Debug, Clone)]
pub struct LoadedPolicy {
    pub name: String,
    pub table: String,
    pub action: Action,
    pub expr: Expr,
    pub description: Option<String>,
}

/// An immutable snapshot of one database's policies
#[derive(Debug, Default)]
pub struct PolicySet {
    policies: Vec<LoadedPolicy>,
}

impl PolicySet {
    /// Enabled policies applicable to `(table, action)`, including ALL
    pub fn applicable(&self, table: &str, action: Action) -> Vec<&LoadedPolicy> {
        self.policies
            .iter()
            .filter(|p| p.table == table && (p.action == action || p.action == Action::All))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Summary rows for the debug surface
    pub fn describe(&self) -> Vec<serde_json::Value> {
        self.policies
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "table": p.table,
                    "action": p.action.as_str(),
                    "description": p.description,
                })
            })
            .collect()
    }
}

/// Per-database policy sets with read-copy-update reloads
pub struct PolicyEngine {
    sets: RwLock<HashMap<String, Arc<PolicySet>>>,
    default_action: DefaultAction,
}

impl PolicyEngine {
    pub fn new(default_action: DefaultAction) -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            default_action,
        }
    }

    pub fn default_action(&self) -> DefaultAction {
        self.default_action
    }

    /// Load (or reload) one database's policies.
    ///
    /// Ensures the storage table exists, optionally seeds the demo set,
    /// parses every expression, and atomically publishes the new snapshot.
    /// A parse failure rejects the whole load and leaves the previous
    /// snapshot in place.
    pub async fn load(&self, pools: &PoolManager, db: &str, seed: bool) -> Result<usize> {
        let records = if pools.mode(db).await? == litrest_common::AccessMode::ReadOnly {
            // No DDL possible; an absent table just means no policies
            pools
                .read(db, |conn| {
                    if store::table_exists(conn)? {
                        store::load_enabled(conn)
                    } else {
                        Ok(Vec::new())
                    }
                })
                .await?
        } else {
            pools
                .write(db, move |conn| {
                    store::ensure_table(conn)?;
                    if seed && store::is_empty(conn)? {
                        let seeded = store::seed_defaults(conn)?;
                        debug!(seeded, "seeded default policies");
                    }
                    store::load_enabled(conn)
                })
                .await?
        };

        let mut policies = Vec::with_capacity(records.len());
        for record in records {
            let expr = Expr::parse(&record.expression).map_err(|e| {
                GatewayError::Validation(format!(
                    "policy {} has a bad expression: {e}",
                    record.name
                ))
            })?;
            policies.push(LoadedPolicy {
                name: record.name,
                table: record.table,
                action: record.action,
                expr,
                description: record.description,
            });
        }

        let count = policies.len();
        self.sets
            .write()
            .insert(db.to_string(), Arc::new(PolicySet { policies }));
        info!(db, count, "policies loaded");
        Ok(count)
    }

    /// Current snapshot for `db`; an empty set when none was loaded
    pub fn snapshot(&self, db: &str) -> Arc<PolicySet> {
        self.sets.read().get(db).cloned().unwrap_or_default()
    }

    /// Inject the applicable policy predicate into a plan.
    ///
    /// Idempotent: a plan that already carries a policy clause is left
    /// untouched, so double application cannot duplicate parameters.
    pub fn apply_to_plan(
        &self,
        db: &str,
        plan: &mut Plan,
        action: Action,
        principal: &Principal,
        schema: &TableSchema,
    ) -> Result<()> {
        if plan.policy.is_some() {
            return Ok(());
        }
        if principal.authenticated && principal.role == ADMIN_ROLE {
            return Ok(());
        }

        let snapshot = self.snapshot(db);
        let applicable = snapshot.applicable(&plan.table, action);
        if applicable.is_empty() {
            return match self.default_action {
                DefaultAction::Allow => Ok(()),
                DefaultAction::Deny => Err(GatewayError::PermissionDenied(format!(
                    "no policy grants {} on {}",
                    action.as_str(),
                    plan.table
                ))),
            };
        }

        let mut fragments = Vec::with_capacity(applicable.len());
        let mut params = Vec::new();
        for policy in &applicable {
            let (sql, mut policy_params) = policy.expr.to_sql(principal, schema)?;
            fragments.push(format!("({sql})"));
            params.append(&mut policy_params);
        }

        plan.policy = Some(PolicyClause {
            sql: fragments.join(" OR "),
            params,
        });
        Ok(())
    }

    /// INSERT-time check: every candidate row must satisfy at least one
    /// applicable policy.
    pub fn check_insert(
        &self,
        db: &str,
        table: &str,
        principal: &Principal,
        rows: &[&serde_json::Map<String, serde_json::Value>],
    ) -> Result<()> {
        if principal.authenticated && principal.role == ADMIN_ROLE {
            return Ok(());
        }

        let snapshot = self.snapshot(db);
        let applicable = snapshot.applicable(table, Action::Insert);
        if applicable.is_empty() {
            return match self.default_action {
                DefaultAction::Allow => Ok(()),
                DefaultAction::Deny => Err(GatewayError::PermissionDenied(format!(
                    "no policy grants INSERT on {table}"
                ))),
            };
        }

        for row in rows {
            let admitted = applicable
                .iter()
                .any(|policy| policy.expr.evaluate(principal, row));
            if !admitted {
                return Err(GatewayError::PermissionDenied(format!(
                    "row rejected by insert policy on {table}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::filter::parse_query;
    use crate::engine::plan::Planner;
    use crate::engine::schema::SchemaCache;
    use crate::pool::map_sqlite_err;
    use litrest_common::{AccessMode, PoolConfig};
    use rusqlite::types::Value;
    use std::time::Duration;

    async fn fixture(name: &str) -> (Arc<PoolManager>, SchemaCache) {
        let pool = Arc::new(PoolManager::new(PoolConfig {
            readers_per_db: 2,
            busy_timeout_ms: 500,
        }));
        pool.attach(name, "", AccessMode::InMemory).await.unwrap();
        pool.write(name, |conn| {
            conn.execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER);
                 CREATE TABLE posts (
                     id INTEGER PRIMARY KEY,
                     author_id INTEGER,
                     is_public INTEGER
                 );",
            )
            .map_err(map_sqlite_err)
        })
        .await
        .unwrap();
        let schemas = SchemaCache::new(Arc::clone(&pool), Duration::from_secs(300));
        (pool, schemas)
    }

    fn user(id: &str, role: &str) -> Principal {
        Principal {
            authenticated: true,
            user_id: id.to_string(),
            role: role.to_string(),
            tenant_id: None,
            claims: Default::default(),
        }
    }

    #[tokio::test]
    async fn load_parses_seeded_policies() {
        let (pool, _) = fixture("pe1").await;
        let engine = PolicyEngine::new(DefaultAction::Allow);
        let count = engine.load(&pool, "pe1", true).await.unwrap();
        assert_eq!(count, 5);
        assert_eq!(engine.snapshot("pe1").applicable("users", Action::Select).len(), 1);
        assert_eq!(engine.snapshot("pe1").applicable("users", Action::Update).len(), 1);
        assert!(engine.snapshot("pe1").applicable("badges", Action::Select).is_empty());
    }

    #[tokio::test]
    async fn bad_expression_rejects_the_load() {
        let (pool, _) = fixture("pe2").await;
        pool.write("pe2", |conn| {
            store::ensure_table(conn)?;
            conn.execute(
                "INSERT INTO _policies (name, table_name, action, expression) \
                 VALUES ('broken', 'users', 'SELECT', 'id ==== nope(')",
                [],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
        .unwrap();

        let engine = PolicyEngine::new(DefaultAction::Allow);
        let err = engine.load(&pool, "pe2", false).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
        // The previous (empty) snapshot is still what readers see
        assert!(engine.snapshot("pe2").is_empty());
    }

    #[tokio::test]
    async fn applies_or_combined_predicate_with_bound_principal() {
        let (pool, schemas) = fixture("pe3").await;
        let engine = PolicyEngine::new(DefaultAction::Allow);
        engine.load(&pool, "pe3", true).await.unwrap();

        let planner = Planner::new(&schemas, "pe3");
        let q = parse_query("").unwrap();
        let (mut plan, schema) = planner.build_select("users", &q).await.unwrap();
        engine
            .apply_to_plan("pe3", &mut plan, Action::Select, &user("2", "user"), &schema)
            .unwrap();
        let clause = plan.policy.as_ref().unwrap();
        assert_eq!(clause.sql, "((`id` = ? OR ? = ?))");
        assert_eq!(
            clause.params,
            vec![
                Value::Text("2".into()),
                Value::Text("user".into()),
                Value::Text("admin".into())
            ]
        );
    }

    #[tokio::test]
    async fn application_is_idempotent_and_admin_bypasses() {
        let (pool, schemas) = fixture("pe4").await;
        let engine = PolicyEngine::new(DefaultAction::Allow);
        engine.load(&pool, "pe4", true).await.unwrap();

        let planner = Planner::new(&schemas, "pe4");
        let q = parse_query("").unwrap();
        let (mut plan, schema) = planner.build_select("users", &q).await.unwrap();

        engine
            .apply_to_plan("pe4", &mut plan, Action::Select, &user("2", "user"), &schema)
            .unwrap();
        let first = plan.policy.clone().unwrap();
        engine
            .apply_to_plan("pe4", &mut plan, Action::Select, &user("2", "user"), &schema)
            .unwrap();
        assert_eq!(plan.policy.as_ref().unwrap().params, first.params);

        let (mut admin_plan, schema) = planner.build_select("users", &q).await.unwrap();
        engine
            .apply_to_plan("pe4", &mut admin_plan, Action::Select, &user("1", "admin"), &schema)
            .unwrap();
        assert!(admin_plan.policy.is_none());
    }

    #[tokio::test]
    async fn deny_default_blocks_unpolicied_tables() {
        let (pool, schemas) = fixture("pe5").await;
        let engine = PolicyEngine::new(DefaultAction::Deny);
        engine.load(&pool, "pe5", false).await.unwrap();

        let planner = Planner::new(&schemas, "pe5");
        let q = parse_query("").unwrap();
        let (mut plan, schema) = planner.build_select("users", &q).await.unwrap();
        let err = engine
            .apply_to_plan("pe5", &mut plan, Action::Select, &user("2", "user"), &schema)
            .unwrap_err();
        assert_eq!(err.kind(), litrest_common::ErrorKind::Permission);
    }

    #[tokio::test]
    async fn insert_checks_admit_and_reject_rows() {
        let (pool, _) = fixture("pe6").await;
        let engine = PolicyEngine::new(DefaultAction::Allow);
        engine.load(&pool, "pe6", true).await.unwrap();

        let row = serde_json::json!({"author_id": 5, "is_public": 1});
        let row = row.as_object().unwrap();

        // posts_insert_authenticated: current_user_id() IS NOT NULL
        engine
            .check_insert("pe6", "posts", &user("5", "user"), &[row])
            .unwrap();
        let err = engine
            .check_insert("pe6", "posts", &Principal::anonymous(), &[row])
            .unwrap_err();
        assert_eq!(err.kind(), litrest_common::ErrorKind::Permission);
    }

    #[tokio::test]
    async fn reload_swaps_the_snapshot_atomically() {
        let (pool, _) = fixture("pe7").await;
        let engine = PolicyEngine::new(DefaultAction::Allow);
        engine.load(&pool, "pe7", true).await.unwrap();
        let before = engine.snapshot("pe7");

        pool.write("pe7", |conn| {
            conn.execute("UPDATE _policies SET enabled = 0", [])
                .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
        .unwrap();
        engine.load(&pool, "pe7", false).await.unwrap();

        // The old snapshot is unchanged; the new one is empty
        assert_eq!(before.len(), 5);
        assert!(engine.snapshot("pe7").is_empty());
    }
}
