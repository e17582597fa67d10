//! Named-procedure dispatch under `/rpc/{name}`
//!
//! Only procedures present in the startup allow-list are callable; anything
//! else is `not_found`. Procedures that touch tables go through the same
//! policy pipeline as the REST verbs, so visibility rules hold transitively.

use std::collections::HashMap;

use litrest_common::{
    validate_ident, GatewayError, Result, ReturnKind, RpcEntryConfig, RpcMethod,
};

use crate::auth::Principal;
use crate::engine::emit::emit_count;
use crate::engine::exec::run_scalar_i64;
use crate::engine::filter::ParsedQuery;
use crate::engine::plan::Planner;
use crate::policy::Action;
use crate::state::AppState;

/// The fixed allow-list of callable procedures
pub struct RpcRegistry {
    entries: HashMap<String, RpcEntryConfig>,
}

impl RpcRegistry {
    pub fn from_config(entries: &[RpcEntryConfig]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| (e.name.clone(), e.clone()))
                .collect(),
        }
    }

    /// Allow-list entries, sorted by name
    pub fn list(&self) -> Vec<&RpcEntryConfig> {
        let mut entries: Vec<&RpcEntryConfig> = self.entries.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Invoke a procedure by name.
    ///
    /// Scalar return kinds wrap as `{"result": …}`; objects serialize
    /// directly.
    pub async fn dispatch(
        &self,
        state: &AppState,
        name: &str,
        method: RpcMethod,
        params: &serde_json::Map<String, serde_json::Value>,
        principal: &Principal,
    ) -> Result<serde_json::Value> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("procedure {name}")))?;
        if entry.method != method {
            return Err(GatewayError::Validation(format!(
                "procedure {name} is callable with {:?} only",
                entry.method
            )));
        }

        let result = match name {
            "ping" => serde_json::Value::String("pong".to_string()),
            "whoami" => principal.describe(),
            "count_rows" => {
                let table = params
                    .get("table")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        GatewayError::Validation(
                            "count_rows requires a table parameter".to_string(),
                        )
                    })?;
                count_rows(state, table, principal).await?
            }
            other => {
                return Err(GatewayError::NotFound(format!("procedure {other}")))
            }
        };

        Ok(match entry.returns {
            ReturnKind::Object => result,
            ReturnKind::String | ReturnKind::Integer => {
                serde_json::json!({ "result": result })
            }
        })
    }
}

/// Policy-filtered row count over the default database
async fn count_rows(
    state: &AppState,
    table: &str,
    principal: &Principal,
) -> Result<serde_json::Value> {
    validate_ident(table)?;
    if litrest_common::ident::is_internal_table(table) {
        return Err(GatewayError::TableNotFound(table.to_string()));
    }
    let db = state.default_db().to_string();

    let planner = Planner::new(&state.schemas, &db);
    let (mut plan, schema) = planner.build_select(table, &ParsedQuery::default()).await?;
    state
        .policies
        .apply_to_plan(&db, &mut plan, Action::Select, principal, &schema)?;

    let (sql, params) = emit_count(&plan);
    let count = state
        .pools
        .read(&db, move |conn| run_scalar_i64(conn, &sql, &params))
        .await?;
    Ok(serde_json::Value::Number(count.into()))
}
