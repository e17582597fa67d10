//! Content negotiation and response rendering
//!
//! | `Accept` | body | status rule |
//! |---|---|---|
//! | `application/json` (default) | JSON array | 200, `[]` when empty |
//! | `text/csv` | CSV with header row | 200 |
//! | `application/vnd.pgrst.object` | single object | 404 empty, 300 multiple |
//! | `application/vnd.pgrst.plan` | `{"plan":{query,args}}` | 200, never executed |

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rusqlite::types::Value;

use litrest_common::GatewayError;

use crate::engine::exec::{value_to_json, QueryOutput};

/// Negotiated response shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Json,
    Csv,
    Object,
    Plan,
}

impl MediaType {
    /// Substring negotiation over the Accept header, PostgREST style
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::Json;
        };
        if accept.contains("text/csv") {
            Self::Csv
        } else if accept.contains("application/vnd.pgrst.object") {
            Self::Object
        } else if accept.contains("application/vnd.pgrst.plan") {
            Self::Plan
        } else {
            Self::Json
        }
    }
}

/// Gateway error as an HTTP response; the one place status codes and the
/// envelope shape are decided
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind().http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.envelope())).into_response()
    }
}

/// Render shaped rows in the negotiated media type
pub fn render_rows(
    media: MediaType,
    output: &QueryOutput,
    content_range: Option<String>,
) -> Response {
    let mut response = match media {
        MediaType::Json => {
            let rows: Vec<serde_json::Value> = output
                .rows
                .iter()
                .cloned()
                .map(serde_json::Value::Object)
                .collect();
            Json(serde_json::Value::Array(rows)).into_response()
        }
        MediaType::Csv => {
            let body = render_csv(output);
            ([(header::CONTENT_TYPE, "text/csv")], body).into_response()
        }
        MediaType::Object => match output.rows.as_slice() {
            [] => (StatusCode::NOT_FOUND, Json(serde_json::json!([]))).into_response(),
            [single] => Json(serde_json::Value::Object(single.clone())).into_response(),
            [first, ..] => (
                StatusCode::MULTIPLE_CHOICES,
                Json(serde_json::Value::Object(first.clone())),
            )
                .into_response(),
        },
        // Plan requests short-circuit before execution; rendering rows for
        // one means the handler skipped that path, so fall back to JSON
        MediaType::Plan => {
            let rows: Vec<serde_json::Value> = output
                .rows
                .iter()
                .cloned()
                .map(serde_json::Value::Object)
                .collect();
            Json(serde_json::Value::Array(rows)).into_response()
        }
    };
    if let Some(range) = content_range {
        if let Ok(value) = range.parse() {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
    }
    response
}

/// Render the pre-execution plan wrapper
pub fn render_plan(sql: &str, params: &[Value]) -> Response {
    let args: Vec<serde_json::Value> = params.iter().cloned().map(value_to_json).collect();
    Json(serde_json::json!({
        "plan": {
            "query": sql,
            "args": args,
        }
    }))
    .into_response()
}

/// `start-end/total`, or `*/total` for an empty page
pub fn content_range(offset: Option<u64>, returned: usize, total: i64) -> String {
    if returned == 0 {
        return format!("*/{total}");
    }
    let start = offset.unwrap_or(0);
    let end = start + returned as u64 - 1;
    format!("{start}-{end}/{total}")
}

fn render_csv(output: &QueryOutput) -> String {
    let mut body = String::new();
    body.push_str(
        &output
            .columns
            .iter()
            .map(|c| csv_field(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    body.push('\n');
    for row in &output.rows {
        let fields: Vec<String> = output
            .columns
            .iter()
            .map(|col| csv_field(&csv_value(row.get(col))))
            .collect();
        body.push_str(&fields.join(","));
        body.push('\n');
    }
    body
}

/// Nulls render empty; nested embeds render as their JSON text
fn csv_value(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(rows: Vec<serde_json::Value>) -> QueryOutput {
        QueryOutput {
            columns: vec!["id".to_string(), "name".to_string()],
            rows: rows
                .into_iter()
                .map(|v| v.as_object().unwrap().clone())
                .collect(),
        }
    }

    #[test]
    fn negotiation_table() {
        assert_eq!(MediaType::negotiate(None), MediaType::Json);
        assert_eq!(
            MediaType::negotiate(Some("application/json")),
            MediaType::Json
        );
        assert_eq!(MediaType::negotiate(Some("text/csv")), MediaType::Csv);
        assert_eq!(
            MediaType::negotiate(Some("application/vnd.pgrst.object")),
            MediaType::Object
        );
        assert_eq!(
            MediaType::negotiate(Some("application/vnd.pgrst.plan")),
            MediaType::Plan
        );
        assert_eq!(MediaType::negotiate(Some("text/html")), MediaType::Json);
    }

    #[test]
    fn object_status_rules() {
        let empty = render_rows(MediaType::Object, &output(vec![]), None);
        assert_eq!(empty.status(), StatusCode::NOT_FOUND);

        let one = render_rows(
            MediaType::Object,
            &output(vec![serde_json::json!({"id": 1, "name": "a"})]),
            None,
        );
        assert_eq!(one.status(), StatusCode::OK);

        let many = render_rows(
            MediaType::Object,
            &output(vec![
                serde_json::json!({"id": 1, "name": "a"}),
                serde_json::json!({"id": 2, "name": "b"}),
            ]),
            None,
        );
        assert_eq!(many.status(), StatusCode::MULTIPLE_CHOICES);
    }

    #[test]
    fn csv_quotes_and_renders_null_empty() {
        let out = output(vec![
            serde_json::json!({"id": 1, "name": "plain"}),
            serde_json::json!({"id": 2, "name": "has,comma"}),
            serde_json::json!({"id": 3, "name": "has\"quote"}),
            serde_json::json!({"id": 4, "name": null}),
        ]);
        let csv = render_csv(&out);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "id,name");
        assert_eq!(lines[1], "1,plain");
        assert_eq!(lines[2], "2,\"has,comma\"");
        assert_eq!(lines[3], "3,\"has\"\"quote\"");
        assert_eq!(lines[4], "4,");
    }

    #[test]
    fn content_range_formats() {
        assert_eq!(content_range(None, 10, 42), "0-9/42");
        assert_eq!(content_range(Some(20), 5, 42), "20-24/42");
        assert_eq!(content_range(Some(100), 0, 42), "*/42");
        assert_eq!(content_range(None, 0, 7), "*/7");
    }

    #[test]
    fn error_statuses_flow_through() {
        let response = ApiError(GatewayError::TableNotFound("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = ApiError(GatewayError::TokenExpired).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
