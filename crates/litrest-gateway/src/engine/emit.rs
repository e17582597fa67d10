//! Plan to SQL rendering
//!
//! Emits a single parameterized statement per plan. Identifiers were
//! validated by the planner and are backtick-quoted here; request values and
//! policy attributes only ever travel as positional parameters, in
//! left-to-right order of the placeholders they bind.

use rusqlite::types::Value;

use litrest_common::quote_ident;

use super::filter::{FilterNode, FilterOp, FilterValue, NullsOrder, OrderKey};
use super::plan::{Embed, Plan};

/// Render a SELECT for the plan.
///
/// With embeds, the window and ordering apply to the base table inside a
/// subselect, so LIMIT counts base rows rather than join rows.
pub fn emit_select(plan: &Plan) -> (String, Vec<Value>) {
    let mut params = Vec::new();

    if plan.embeds.is_empty() {
        let projection = if plan.columns.is_empty() {
            "*".to_string()
        } else {
            plan.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {projection} FROM {}", quote_ident(&plan.table));
        push_where(&mut sql, plan, &mut params);
        push_order(&mut sql, &plan.ordering, None);
        push_window(&mut sql, plan, &mut params);
        return (sql, params);
    }

    // Joined shape: aliased projection over a windowed base subselect
    let base = quote_ident(&plan.table);
    let mut projection: Vec<String> = plan
        .columns
        .iter()
        .map(|c| format!("{base}.{} AS {}", quote_ident(c), quote_ident(c)))
        .collect();
    for embed in &plan.embeds {
        push_embed_projection(embed, &mut projection);
    }

    let mut inner = format!("SELECT * FROM {base}");
    push_where(&mut inner, plan, &mut params);
    push_order(&mut inner, &plan.ordering, None);
    push_window(&mut inner, plan, &mut params);

    let mut sql = format!(
        "SELECT {} FROM ({inner}) AS {base}",
        projection.join(", ")
    );
    for embed in &plan.embeds {
        push_join(&plan.table, embed, &mut sql);
    }

    // Keep base-row order stable across the join
    if !plan.ordering.is_empty() {
        push_order(&mut sql, &plan.ordering, Some(&plan.table));
    } else if !plan.key_columns.is_empty() {
        let keys: Vec<OrderKey> = plan
            .key_columns
            .iter()
            .map(|c| OrderKey {
                column: c.clone(),
                descending: false,
                nulls: None,
            })
            .collect();
        push_order(&mut sql, &keys, Some(&plan.table));
    }

    (sql, params)
}

/// Render the total-count companion of a SELECT (no window)
pub fn emit_count(plan: &Plan) -> (String, Vec<Value>) {
    let mut params = Vec::new();
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&plan.table));
    push_where(&mut sql, plan, &mut params);
    (sql, params)
}

/// Render an INSERT of one row; `columns` come pre-validated and ordered
pub fn emit_insert(
    table: &str,
    columns: &[String],
    row: &serde_json::Map<String, serde_json::Value>,
) -> (String, Vec<Value>) {
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        quoted.join(", "),
        placeholders.join(", ")
    );
    let params = columns
        .iter()
        .map(|c| json_to_sql(row.get(c).unwrap_or(&serde_json::Value::Null)))
        .collect();
    (sql, params)
}

/// Render an UPDATE; SET parameters precede the WHERE parameters
pub fn emit_update(
    plan: &Plan,
    columns: &[String],
    row: &serde_json::Map<String, serde_json::Value>,
) -> (String, Vec<Value>) {
    let mut params: Vec<Value> = columns
        .iter()
        .map(|c| json_to_sql(row.get(c).unwrap_or(&serde_json::Value::Null)))
        .collect();
    let assignments: Vec<String> = columns
        .iter()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect();
    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_ident(&plan.table),
        assignments.join(", ")
    );
    push_where(&mut sql, plan, &mut params);
    (sql, params)
}

/// Render a DELETE
pub fn emit_delete(plan: &Plan) -> (String, Vec<Value>) {
    let mut params = Vec::new();
    let mut sql = format!("DELETE FROM {}", quote_ident(&plan.table));
    push_where(&mut sql, plan, &mut params);
    (sql, params)
}

/// Compose the WHERE clause: request filters first, then the policy
/// predicate, each parenthesized and joined with AND
fn push_where(sql: &mut String, plan: &Plan, params: &mut Vec<Value>) {
    let mut clauses = Vec::new();
    for node in &plan.filters {
        clauses.push(render_node(node, params));
    }
    if let Some(policy) = &plan.policy {
        clauses.push(format!("({})", policy.sql));
        params.extend(policy.params.iter().cloned());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
}

fn render_node(node: &FilterNode, params: &mut Vec<Value>) -> String {
    match node {
        FilterNode::Atom { column, op, value } => render_atom(column, *op, value, params),
        FilterNode::Group { any, children } => {
            let joiner = if *any { " OR " } else { " AND " };
            let parts: Vec<String> = children
                .iter()
                .map(|child| render_node(child, params))
                .collect();
            format!("({})", parts.join(joiner))
        }
        FilterNode::Not(inner) => format!("NOT ({})", render_node(inner, params)),
    }
}

fn render_atom(
    column: &str,
    op: FilterOp,
    value: &FilterValue,
    params: &mut Vec<Value>,
) -> String {
    let ident = quote_ident(column);
    match (op, value) {
        (FilterOp::Eq, FilterValue::Literal(v)) => bind(params, v, format!("{ident} = ?")),
        (FilterOp::Neq, FilterValue::Literal(v)) => bind(params, v, format!("{ident} != ?")),
        (FilterOp::Gt, FilterValue::Literal(v)) => bind(params, v, format!("{ident} > ?")),
        (FilterOp::Gte, FilterValue::Literal(v)) => bind(params, v, format!("{ident} >= ?")),
        (FilterOp::Lt, FilterValue::Literal(v)) => bind(params, v, format!("{ident} < ?")),
        (FilterOp::Lte, FilterValue::Literal(v)) => bind(params, v, format!("{ident} <= ?")),
        (FilterOp::Like, FilterValue::Literal(v)) => {
            params.push(Value::Text(v.replace('*', "%")));
            format!("{ident} LIKE ?")
        }
        (FilterOp::ILike, FilterValue::Literal(v)) => {
            params.push(Value::Text(v.replace('*', "%")));
            format!("LOWER({ident}) LIKE LOWER(?)")
        }
        (FilterOp::In, FilterValue::List(items)) => {
            if items.is_empty() {
                // An empty IN list matches nothing
                return "1 = 0".to_string();
            }
            let placeholders: Vec<&str> = items.iter().map(|_| "?").collect();
            for item in items {
                params.push(Value::Text(item.clone()));
            }
            format!("{ident} IN ({})", placeholders.join(", "))
        }
        (FilterOp::Is, FilterValue::Null) => format!("{ident} IS NULL"),
        (FilterOp::Is, FilterValue::NotNull) => format!("{ident} IS NOT NULL"),
        // The parser only produces the pairings above; anything else is a
        // non-match by construction
        _ => "1 = 0".to_string(),
    }
}

fn bind(params: &mut Vec<Value>, value: &str, fragment: String) -> String {
    params.push(Value::Text(value.to_string()));
    fragment
}

fn push_order(sql: &mut String, keys: &[OrderKey], qualifier: Option<&str>) {
    if keys.is_empty() {
        return;
    }
    let parts: Vec<String> = keys
        .iter()
        .map(|key| {
            let ident = match qualifier {
                Some(table) => format!("{}.{}", quote_ident(table), quote_ident(&key.column)),
                None => quote_ident(&key.column),
            };
            let mut part = format!(
                "{ident} {}",
                if key.descending { "DESC" } else { "ASC" }
            );
            match key.nulls {
                Some(NullsOrder::First) => part.push_str(" NULLS FIRST"),
                Some(NullsOrder::Last) => part.push_str(" NULLS LAST"),
                None => {}
            }
            part
        })
        .collect();
    sql.push_str(" ORDER BY ");
    sql.push_str(&parts.join(", "));
}

fn push_window(sql: &mut String, plan: &Plan, params: &mut Vec<Value>) {
    match (plan.window.limit, plan.window.offset) {
        (Some(limit), Some(offset)) => {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(limit as i64));
            params.push(Value::Integer(offset as i64));
        }
        (Some(limit), None) => {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        (None, Some(offset)) => {
            sql.push_str(" LIMIT -1 OFFSET ?");
            params.push(Value::Integer(offset as i64));
        }
        (None, None) => {}
    }
}

fn push_embed_projection(embed: &Embed, projection: &mut Vec<String>) {
    let alias = quote_ident(&embed.alias_path);
    for col in &embed.columns {
        projection.push(format!(
            "{alias}.{} AS {}",
            quote_ident(col),
            quote_ident(&format!("{}.{}", embed.alias_path, col))
        ));
    }
    for child in &embed.embeds {
        push_embed_projection(child, projection);
    }
}

fn push_join(parent_alias: &str, embed: &Embed, sql: &mut String) {
    sql.push_str(&format!(
        " LEFT JOIN {} AS {} ON {}.{} = {}.{}",
        quote_ident(&embed.foreign_table),
        quote_ident(&embed.alias_path),
        quote_ident(parent_alias),
        quote_ident(&embed.local_col),
        quote_ident(&embed.alias_path),
        quote_ident(&embed.foreign_col),
    ));
    for child in &embed.embeds {
        push_join(&embed.alias_path, child, sql);
    }
}

/// Convert a JSON body value to a SQLite parameter
pub fn json_to_sql(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        // Nested structures persist as their JSON text
        other => Value::Text(other.to_string()),
    }
}
