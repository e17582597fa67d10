//! Statement execution and response-row shaping
//!
//! Rows come back as JSON objects (blobs as base64, NULL as null). When the
//! plan embeds relations, the flat join output is folded: rows sharing the
//! base fold key collapse into one object, with embedded rows nested as
//! arrays (reverse edges) or single objects (forward edges).

use std::collections::HashMap;

use base64::Engine as _;
use rusqlite::types::Value;
use rusqlite::Connection;

use litrest_common::Result;

use crate::pool::map_sqlite_err;

use super::plan::{Embed, Plan};

/// Column order plus shaped rows, ready for content negotiation
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Run a planned SELECT and shape its rows
pub fn run_select(conn: &Connection, plan: &Plan, sql: &str, params: &[Value]) -> Result<QueryOutput> {
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_err)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut raw_rows: Vec<Vec<Value>> = Vec::new();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter()))
        .map_err(map_sqlite_err)?;
    while let Some(row) = rows.next().map_err(map_sqlite_err)? {
        let mut values = Vec::with_capacity(names.len());
        for i in 0..names.len() {
            values.push(row.get::<_, Value>(i).map_err(map_sqlite_err)?);
        }
        raw_rows.push(values);
    }

    if plan.embeds.is_empty() {
        let rows = raw_rows
            .into_iter()
            .map(|values| {
                names
                    .iter()
                    .cloned()
                    .zip(values.into_iter().map(value_to_json))
                    .collect()
            })
            .collect();
        return Ok(QueryOutput {
            columns: names,
            rows,
        });
    }

    Ok(fold_rows(plan, &names, raw_rows))
}

/// Run a mutation, returning the affected-row count
pub fn run_execute(conn: &Connection, sql: &str, params: &[Value]) -> Result<usize> {
    conn.execute(sql, rusqlite::params_from_iter(params.iter()))
        .map_err(map_sqlite_err)
}

/// Run a single-value query (COUNT and friends)
pub fn run_scalar_i64(conn: &Connection, sql: &str, params: &[Value]) -> Result<i64> {
    conn.query_row(sql, rusqlite::params_from_iter(params.iter()), |row| {
        row.get(0)
    })
    .map_err(map_sqlite_err)
}

/// SQLite value to JSON: integers and reals as numbers, blobs as base64
pub fn value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::Number(i.into()),
        Value::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s),
        Value::Blob(bytes) => serde_json::Value::String(
            base64::engine::general_purpose::STANDARD.encode(bytes),
        ),
    }
}

// Folding machinery: an order-preserving tree keyed by each level's fold
// columns, materialized into nested JSON at the end.

struct Node {
    obj: serde_json::Map<String, serde_json::Value>,
    children: Vec<ChildSlot>,
}

struct ChildSlot {
    seen: HashMap<String, usize>,
    nodes: Vec<Node>,
}

fn fold_rows(plan: &Plan, names: &[String], raw_rows: Vec<Vec<Value>>) -> QueryOutput {
    let idx: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut roots: Vec<Node> = Vec::new();

    for row in &raw_rows {
        let key = fold_key(row, &idx, &plan.key_columns, "");
        let root_index = match seen.get(&key) {
            Some(&i) => i,
            None => {
                let mut obj = serde_json::Map::new();
                for col in &plan.output_columns {
                    if let Some(&i) = idx.get(col.as_str()) {
                        obj.insert(col.clone(), value_to_json(row[i].clone()));
                    }
                }
                roots.push(Node {
                    obj,
                    children: plan.embeds.iter().map(|_| empty_slot()).collect(),
                });
                seen.insert(key, roots.len() - 1);
                roots.len() - 1
            }
        };
        let root = &mut roots[root_index];
        for (slot, embed) in root.children.iter_mut().zip(&plan.embeds) {
            insert_embed_row(slot, embed, row, &idx);
        }
    }

    let mut columns: Vec<String> = plan.output_columns.clone();
    columns.extend(plan.embeds.iter().map(|e| e.field.clone()));

    let rows = roots
        .into_iter()
        .map(|node| materialize(node, &plan.embeds))
        .collect();

    QueryOutput { columns, rows }
}

fn empty_slot() -> ChildSlot {
    ChildSlot {
        seen: HashMap::new(),
        nodes: Vec::new(),
    }
}

fn insert_embed_row(
    slot: &mut ChildSlot,
    embed: &Embed,
    row: &[Value],
    idx: &HashMap<&str, usize>,
) {
    // A join miss leaves every key column NULL
    let all_null = embed.key_columns.iter().all(|key| {
        idx.get(format!("{}.{}", embed.alias_path, key).as_str())
            .map(|&i| row[i] == Value::Null)
            .unwrap_or(true)
    });
    if all_null {
        return;
    }

    let key = fold_key(row, idx, &embed.key_columns, &embed.alias_path);
    let node_index = match slot.seen.get(&key) {
        Some(&i) => i,
        None => {
            let mut obj = serde_json::Map::new();
            for col in &embed.output_columns {
                if let Some(&i) = idx.get(format!("{}.{}", embed.alias_path, col).as_str()) {
                    obj.insert(col.clone(), value_to_json(row[i].clone()));
                }
            }
            slot.nodes.push(Node {
                obj,
                children: embed.embeds.iter().map(|_| empty_slot()).collect(),
            });
            slot.seen.insert(key, slot.nodes.len() - 1);
            slot.nodes.len() - 1
        }
    };
    let node = &mut slot.nodes[node_index];
    for (child_slot, child) in node.children.iter_mut().zip(&embed.embeds) {
        insert_embed_row(child_slot, child, row, idx);
    }
}

fn fold_key(
    row: &[Value],
    idx: &HashMap<&str, usize>,
    key_columns: &[String],
    alias_path: &str,
) -> String {
    let mut parts = Vec::with_capacity(key_columns.len());
    for key in key_columns {
        let name = if alias_path.is_empty() {
            key.clone()
        } else {
            format!("{alias_path}.{key}")
        };
        let value = idx
            .get(name.as_str())
            .map(|&i| value_to_json(row[i].clone()))
            .unwrap_or(serde_json::Value::Null);
        parts.push(value.to_string());
    }
    parts.join("\u{1f}")
}

fn materialize(node: Node, embeds: &[Embed]) -> serde_json::Map<String, serde_json::Value> {
    let mut obj = node.obj;
    for (slot, embed) in node.children.into_iter().zip(embeds) {
        let mut rendered: Vec<serde_json::Value> = slot
            .nodes
            .into_iter()
            .map(|n| serde_json::Value::Object(materialize(n, &embed.embeds)))
            .collect();
        let value = if embed.to_many {
            serde_json::Value::Array(rendered)
        } else if rendered.is_empty() {
            serde_json::Value::Null
        } else {
            rendered.remove(0)
        };
        obj.insert(embed.field.clone(), value);
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::emit::emit_select;
    use crate::engine::filter::parse_query;
    use crate::engine::plan::Planner;
    use crate::engine::schema::SchemaCache;
    use crate::pool::PoolManager;
    use litrest_common::{AccessMode, PoolConfig};
    use std::sync::Arc;
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
                     author_id INTEGER REFERENCES users(id),
                     title TEXT
                 );
                 INSERT INTO users VALUES (1, 'Ann', 30), (2, 'Bob', 17), (3, 'Carl', 40);
                 INSERT INTO posts VALUES (10, 1, 'Hello'), (11, 1, 'Again'), (12, 3, 'Hi');",
            )
            .map_err(map_sqlite_err)
        })
        .await
        .unwrap();
        let schemas = SchemaCache::new(Arc::clone(&pool), Duration::from_secs(300));
        (pool, schemas)
    }

    #[tokio::test]
    async fn select_rows_become_json_objects() {
        let (pool, schemas) = fixture("e1").await;
        let planner = Planner::new(&schemas, "e1");
        let q = parse_query("age=gt.18&order=id.asc").unwrap();
        let (plan, _) = planner.build_select("users", &q).await.unwrap();
        let (sql, params) = emit_select(&plan);

        let out = pool
            .read("e1", move |conn| run_select(conn, &plan, &sql, &params))
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 2);
        assert_eq!(
            serde_json::Value::Array(
                out.rows.iter().cloned().map(serde_json::Value::Object).collect()
            ),
            serde_json::json!([
                {"id": 1, "name": "Ann", "age": 30},
                {"id": 3, "name": "Carl", "age": 40}
            ])
        );
    }

    #[tokio::test]
    async fn embedded_rows_fold_into_arrays() {
        let (pool, schemas) = fixture("e2").await;
        let planner = Planner::new(&schemas, "e2");
        let q = parse_query("select=id,posts(title)&order=id.asc").unwrap();
        let (plan, _) = planner.build_select("users", &q).await.unwrap();
        let (sql, params) = emit_select(&plan);

        let out = pool
            .read("e2", move |conn| run_select(conn, &plan, &sql, &params))
            .await
            .unwrap();
        assert_eq!(
            serde_json::Value::Array(
                out.rows.iter().cloned().map(serde_json::Value::Object).collect()
            ),
            serde_json::json!([
                {"id": 1, "posts": [{"title": "Hello"}, {"title": "Again"}]},
                {"id": 2, "posts": []},
                {"id": 3, "posts": [{"title": "Hi"}]}
            ])
        );
        assert_eq!(out.columns, vec!["id", "posts"]);
    }

    #[tokio::test]
    async fn forward_embed_folds_to_object_or_null() {
        let (pool, schemas) = fixture("e3").await;
        let planner = Planner::new(&schemas, "e3");
        let q = parse_query("select=title,users(name)&order=id.asc").unwrap();
        let (plan, _) = planner.build_select("posts", &q).await.unwrap();
        let (sql, params) = emit_select(&plan);

        let out = pool
            .read("e3", move |conn| run_select(conn, &plan, &sql, &params))
            .await
            .unwrap();
        assert_eq!(
            serde_json::Value::Object(out.rows[0].clone()),
            serde_json::json!({"title": "Hello", "users": {"name": "Ann"}})
        );
    }

    #[tokio::test]
    async fn limit_counts_base_rows_not_join_rows() {
        let (pool, schemas) = fixture("e4").await;
        let planner = Planner::new(&schemas, "e4");
        // User 1 has two posts; a naive join LIMIT 1 would truncate them
        let q = parse_query("select=id,posts(title)&order=id.asc&limit=1").unwrap();
        let (plan, _) = planner.build_select("users", &q).await.unwrap();
        let (sql, params) = emit_select(&plan);

        let out = pool
            .read("e4", move |conn| run_select(conn, &plan, &sql, &params))
            .await
            .unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0]["posts"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn blobs_render_as_base64() {
        let (pool, _) = fixture("e5").await;
        pool.write("e5", |conn| {
            conn.execute_batch("CREATE TABLE files (id INTEGER PRIMARY KEY, data BLOB)")
                .map_err(map_sqlite_err)?;
            conn.execute(
                "INSERT INTO files (id, data) VALUES (1, ?1)",
                [Value::Blob(vec![0xde, 0xad, 0xbe, 0xef])],
            )
            .map_err(map_sqlite_err)?;
            Ok(())
        })
        .await
        .unwrap();

        let json = value_to_json(Value::Blob(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(json, serde_json::json!("3q2+7w=="));
    }
}
