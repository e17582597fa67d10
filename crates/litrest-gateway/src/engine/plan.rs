//! Schema-validated query plans
//!
//! The planner turns a parsed request into a [`Plan`]: every column
//! reference is checked against the schema cache before any SQL exists, and
//! embedded relations are resolved to foreign-key join edges. The emitter
//! consumes plans verbatim; nothing downstream re-validates.

use std::sync::Arc;

use litrest_common::{validate_ident, GatewayError, Result};

use super::filter::{FilterNode, OrderKey, ParsedQuery, SelectItem};
use super::schema::{SchemaCache, TableSchema};

/// Maximum embedding recursion depth
const MAX_EMBED_DEPTH: usize = 4;

/// LIMIT/OFFSET window, base table only
#[derive(Debug, Clone, Copy, Default)]
pub struct Window {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Row-level policy predicate, pre-rendered with bound parameters.
///
/// Attached once by the policy engine; the emitter conjoins it after the
/// request's own filters and appends its parameters after theirs.
#[derive(Debug, Clone)]
pub struct PolicyClause {
    pub sql: String,
    pub params: Vec<rusqlite::types::Value>,
}

/// One resolved embedded relation
#[derive(Debug, Clone)]
pub struct Embed {
    /// Field name in the response object
    pub field: String,
    /// Dotted alias path used in SQL (`posts`, `posts.comments`)
    pub alias_path: String,
    /// Join column on the parent side
    pub local_col: String,
    pub foreign_table: String,
    /// Join column on the embedded side
    pub foreign_col: String,
    /// Reverse edges render arrays, forward edges a single object
    pub to_many: bool,
    /// Columns emitted in SQL (requested plus fold keys)
    pub columns: Vec<String>,
    /// Columns the caller asked for
    pub output_columns: Vec<String>,
    /// Fold keys (primary key, or every column when none is declared)
    pub key_columns: Vec<String>,
    pub embeds: Vec<Embed>,
}

/// The validated, emit-ready form of one request
#[derive(Debug, Clone)]
pub struct Plan {
    pub table: String,
    /// Base columns emitted in SQL; empty means `*`
    pub columns: Vec<String>,
    /// Base columns in the response; empty means all
    pub output_columns: Vec<String>,
    pub filters: Vec<FilterNode>,
    pub ordering: Vec<OrderKey>,
    pub window: Window,
    pub embeds: Vec<Embed>,
    /// Fold keys for the base table when embeds exist
    pub key_columns: Vec<String>,
    pub policy: Option<PolicyClause>,
}

impl Plan {
    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }
}

/// Builds plans against one database's schemas
pub struct Planner<'a> {
    schemas: &'a SchemaCache,
    db: &'a str,
}

impl<'a> Planner<'a> {
    pub fn new(schemas: &'a SchemaCache, db: &'a str) -> Self {
        Self { schemas, db }
    }

    /// Plan a SELECT: projection, embeds, filters, ordering, window
    pub async fn build_select(
        &self,
        table: &str,
        query: &ParsedQuery,
    ) -> Result<(Plan, Arc<TableSchema>)> {
        validate_ident(table)?;
        let schema = self.schemas.get(self.db, table).await?;

        let mut star = query.select.is_empty();
        let mut output_columns = Vec::new();
        let mut embeds = Vec::new();

        for item in &query.select {
            match item {
                SelectItem::All => star = true,
                SelectItem::Column(name) => {
                    if schema.has_column(name) {
                        validate_ident(name)?;
                        output_columns.push(name.clone());
                    } else {
                        // Bare-name shorthand for `name(*)`
                        embeds.push(
                            self.resolve_embed(&schema, "", name, &[SelectItem::All], 1)
                                .await?,
                        );
                    }
                }
                SelectItem::Embed { name, items } => {
                    embeds.push(self.resolve_embed(&schema, "", name, items, 1).await?);
                }
            }
        }

        validate_filters(&schema, &query.filters)?;
        for key in &query.order {
            validate_ident(&key.column)?;
            if !schema.has_column(&key.column) {
                return Err(GatewayError::UnknownColumn(key.column.clone()));
            }
        }

        let (columns, output_columns, key_columns) = if embeds.is_empty() {
            let cols = if star { Vec::new() } else { output_columns.clone() };
            let output = if star { Vec::new() } else { output_columns };
            (cols, output, Vec::new())
        } else {
            // Joins need explicit base columns plus fold keys
            let requested: Vec<String> = if star {
                schema.columns.iter().map(|c| c.name.clone()).collect()
            } else {
                output_columns
            };
            let keys = fold_keys(&schema);
            let mut emitted = requested.clone();
            for key in &keys {
                if !emitted.contains(key) {
                    emitted.push(key.clone());
                }
            }
            (emitted, requested, keys)
        };

        Ok((
            Plan {
                table: table.to_string(),
                columns,
                output_columns,
                filters: query.filters.clone(),
                ordering: query.order.clone(),
                window: Window {
                    limit: query.limit,
                    offset: query.offset,
                },
                embeds,
                key_columns,
                policy: None,
            },
            schema,
        ))
    }

    /// Plan an UPDATE or DELETE: filters are mandatory and validated
    pub async fn build_mutation(
        &self,
        table: &str,
        query: &ParsedQuery,
        verb: &'static str,
    ) -> Result<(Plan, Arc<TableSchema>)> {
        validate_ident(table)?;
        let schema = self.schemas.get(self.db, table).await?;
        if query.filters.is_empty() {
            return Err(GatewayError::MissingWhere(verb));
        }
        validate_filters(&schema, &query.filters)?;
        Ok((
            Plan {
                table: table.to_string(),
                columns: Vec::new(),
                output_columns: Vec::new(),
                filters: query.filters.clone(),
                ordering: Vec::new(),
                window: Window::default(),
                embeds: Vec::new(),
                key_columns: Vec::new(),
                policy: None,
            },
            schema,
        ))
    }

    fn resolve_embed<'s>(
        &'s self,
        parent: &'s TableSchema,
        parent_path: &'s str,
        name: &'s str,
        items: &'s [SelectItem],
        depth: usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Embed>> + Send + 's>> {
        Box::pin(async move {
            if depth > MAX_EMBED_DEPTH {
                return Err(GatewayError::Validation(format!(
                    "embedding depth exceeds {MAX_EMBED_DEPTH}"
                )));
            }
            validate_ident(name).map_err(|_| GatewayError::UnknownRelation(name.to_string()))?;

            let foreign = match self.schemas.get(self.db, name).await {
                Ok(schema) => schema,
                Err(GatewayError::TableNotFound(_)) => {
                    return Err(GatewayError::UnknownRelation(name.to_string()))
                }
                Err(e) => return Err(e),
            };

            // Forward edge: the parent row holds the key (to-one)
            let (local_col, foreign_col, to_many) =
                if let Some(fk) = parent.foreign_key_to(name) {
                    let foreign_col = match &fk.ref_column {
                        Some(col) => col.clone(),
                        None => single_pk(&foreign).ok_or_else(|| {
                            GatewayError::UnknownRelation(name.to_string())
                        })?,
                    };
                    (fk.from_column.clone(), foreign_col, false)
                } else if let Some(fk) = foreign.foreign_key_to(&parent.name) {
                    // Reverse edge: the embedded rows point back (to-many)
                    let local_col = match &fk.ref_column {
                        Some(col) => col.clone(),
                        None => single_pk(parent).ok_or_else(|| {
                            GatewayError::UnknownRelation(name.to_string())
                        })?,
                    };
                    (local_col, fk.from_column.clone(), true)
                } else {
                    return Err(GatewayError::UnknownRelation(name.to_string()));
                };

            let alias_path = if parent_path.is_empty() {
                name.to_string()
            } else {
                format!("{parent_path}.{name}")
            };

            let mut star = false;
            let mut output_columns = Vec::new();
            let mut embeds = Vec::new();
            for item in items {
                match item {
                    SelectItem::All => star = true,
                    SelectItem::Column(col) => {
                        if foreign.has_column(col) {
                            validate_ident(col)?;
                            output_columns.push(col.clone());
                        } else {
                            embeds.push(
                                self.resolve_embed(
                                    &foreign,
                                    &alias_path,
                                    col,
                                    &[SelectItem::All],
                                    depth + 1,
                                )
                                .await?,
                            );
                        }
                    }
                    SelectItem::Embed { name: inner, items } => {
                        embeds.push(
                            self.resolve_embed(&foreign, &alias_path, inner, items, depth + 1)
                                .await?,
                        );
                    }
                }
            }

            let requested: Vec<String> = if star || output_columns.is_empty() && embeds.is_empty() {
                foreign.columns.iter().map(|c| c.name.clone()).collect()
            } else {
                output_columns.clone()
            };
            let key_columns = fold_keys(&foreign);
            let mut columns = requested.clone();
            for key in &key_columns {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
            let output_columns = if star { requested.clone() } else { output_columns };

            Ok(Embed {
                field: name.to_string(),
                alias_path,
                local_col,
                foreign_table: name.to_string(),
                foreign_col,
                to_many,
                columns,
                output_columns,
                key_columns,
                embeds,
            })
        })
    }
}

/// Columns join rows are folded on: the primary key, or every column when
/// the table declares none
fn fold_keys(schema: &TableSchema) -> Vec<String> {
    let pks: Vec<String> = schema
        .primary_key_columns()
        .iter()
        .map(|s| s.to_string())
        .collect();
    if pks.is_empty() {
        schema.columns.iter().map(|c| c.name.clone()).collect()
    } else {
        pks
    }
}

fn single_pk(schema: &TableSchema) -> Option<String> {
    match schema.primary_key_columns().as_slice() {
        [only] => Some(only.to_string()),
        _ => None,
    }
}

/// Check every atom column in a filter tree against the schema
pub fn validate_filters(schema: &TableSchema, filters: &[FilterNode]) -> Result<()> {
    for node in filters {
        validate_filter_node(schema, node)?;
    }
    Ok(())
}

fn validate_filter_node(schema: &TableSchema, node: &FilterNode) -> Result<()> {
    match node {
        FilterNode::Atom { column, .. } => {
            validate_ident(column)?;
            if !schema.has_column(column) {
                return Err(GatewayError::UnknownColumn(column.clone()));
            }
            Ok(())
        }
        FilterNode::Group { children, .. } => {
            for child in children {
                validate_filter_node(schema, child)?;
            }
            Ok(())
        }
        FilterNode::Not(inner) => validate_filter_node(schema, inner),
    }
}

/// Check mutation body keys against the schema, returning them in a
/// deterministic order
pub fn validate_body_columns(
    schema: &TableSchema,
    body: &serde_json::Map<String, serde_json::Value>,
) -> Result<Vec<String>> {
    if body.is_empty() {
        return Err(GatewayError::Validation(
            "empty body: no columns to write".to_string(),
        ));
    }
    let mut columns: Vec<String> = Vec::with_capacity(body.len());
    for key in body.keys() {
        validate_ident(key)?;
        if !schema.has_column(key) {
            return Err(GatewayError::UnknownColumn(key.clone()));
        }
        columns.push(key.clone());
    }
    columns.sort();
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::filter::parse_query;
    use crate::pool::{map_sqlite_err, PoolManager};
    use litrest_common::{AccessMode, PoolConfig};
    use std::time::Duration;

    async fn fixture(name: &str) -> SchemaCache {
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
                 CREATE TABLE comments (
                     id INTEGER PRIMARY KEY,
                     post_id INTEGER REFERENCES posts(id),
                     body TEXT
                 );",
            )
            .map_err(map_sqlite_err)
        })
        .await
        .unwrap();
        SchemaCache::new(pool, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn plans_simple_select() {
        let schemas = fixture("p1").await;
        let planner = Planner::new(&schemas, "p1");
        let q = parse_query("age=gt.18&order=id.asc&limit=10").unwrap();
        let (plan, _) = planner.build_select("users", &q).await.unwrap();
        assert!(plan.columns.is_empty());
        assert_eq!(plan.filters.len(), 1);
        assert_eq!(plan.ordering.len(), 1);
        assert_eq!(plan.window.limit, Some(10));
        assert!(plan.embeds.is_empty());
    }

    #[tokio::test]
    async fn rejects_unknown_column_everywhere() {
        let schemas = fixture("p2").await;
        let planner = Planner::new(&schemas, "p2");

        let q = parse_query("bogus=eq.1").unwrap();
        let err = planner.build_select("users", &q).await.unwrap_err();
        assert_eq!(err.details(), Some("unknown_column"));

        let q = parse_query("order=bogus").unwrap();
        let err = planner.build_select("users", &q).await.unwrap_err();
        assert_eq!(err.details(), Some("unknown_column"));
    }

    #[tokio::test]
    async fn resolves_reverse_embed_as_to_many() {
        let schemas = fixture("p3").await;
        let planner = Planner::new(&schemas, "p3");
        let q = parse_query("select=id,posts(title)").unwrap();
        let (plan, _) = planner.build_select("users", &q).await.unwrap();

        assert_eq!(plan.key_columns, vec!["id"]);
        assert_eq!(plan.embeds.len(), 1);
        let embed = &plan.embeds[0];
        assert_eq!(embed.local_col, "id");
        assert_eq!(embed.foreign_table, "posts");
        assert_eq!(embed.foreign_col, "author_id");
        assert!(embed.to_many);
        assert_eq!(embed.output_columns, vec!["title"]);
        // Fold key rides along in the emitted columns
        assert!(embed.columns.contains(&"id".to_string()));
    }

    #[tokio::test]
    async fn resolves_forward_embed_as_to_one() {
        let schemas = fixture("p4").await;
        let planner = Planner::new(&schemas, "p4");
        let q = parse_query("select=title,users(name)").unwrap();
        let (plan, _) = planner.build_select("posts", &q).await.unwrap();
        let embed = &plan.embeds[0];
        assert_eq!(embed.local_col, "author_id");
        assert_eq!(embed.foreign_col, "id");
        assert!(!embed.to_many);
    }

    #[tokio::test]
    async fn resolves_nested_embeds_and_caps_depth() {
        let schemas = fixture("p5").await;
        let planner = Planner::new(&schemas, "p5");
        let q = parse_query("select=id,posts(title,comments(body))").unwrap();
        let (plan, _) = planner.build_select("users", &q).await.unwrap();
        let posts = &plan.embeds[0];
        assert_eq!(posts.embeds.len(), 1);
        assert_eq!(posts.embeds[0].alias_path, "posts.comments");
        assert_eq!(posts.embeds[0].foreign_col, "post_id");
    }

    #[tokio::test]
    async fn unknown_relation_is_flagged() {
        let schemas = fixture("p6").await;
        let planner = Planner::new(&schemas, "p6");
        let q = parse_query("select=*,followers").unwrap();
        let err = planner.build_select("users", &q).await.unwrap_err();
        assert_eq!(err.details(), Some("unknown_relation"));

        // A real table with no foreign-key edge either way
        let q = parse_query("select=*,comments(body)").unwrap();
        let err = planner.build_select("users", &q).await.unwrap_err();
        assert_eq!(err.details(), Some("unknown_relation"));
    }

    #[tokio::test]
    async fn mutations_require_filters() {
        let schemas = fixture("p7").await;
        let planner = Planner::new(&schemas, "p7");
        let q = parse_query("").unwrap();
        let err = planner
            .build_mutation("users", &q, "UPDATE")
            .await
            .unwrap_err();
        assert_eq!(err.details(), Some("missing_where"));

        let q = parse_query("id=eq.1").unwrap();
        let (plan, _) = planner.build_mutation("users", &q, "DELETE").await.unwrap();
        assert!(plan.has_filters());
    }

    #[tokio::test]
    async fn body_columns_are_validated_and_sorted() {
        let schemas = fixture("p8").await;
        let schema = schemas.get("p8", "users").await.unwrap();

        let body = serde_json::json!({"name": "Ann", "age": 30});
        let cols = validate_body_columns(&schema, body.as_object().unwrap()).unwrap();
        assert_eq!(cols, vec!["age", "name"]);

        let body = serde_json::json!({"nope": 1});
        let err = validate_body_columns(&schema, body.as_object().unwrap()).unwrap_err();
        assert_eq!(err.details(), Some("unknown_column"));
    }
}
