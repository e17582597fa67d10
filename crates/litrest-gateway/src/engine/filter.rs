//! PostgREST-style query-string grammar
//!
//! Recognized parameter families, most specific first:
//!
//! | key | meaning |
//! |---|---|
//! | `select` | projection list, possibly with embedded relations |
//! | `order` | `col[.asc\|.desc][.nullsfirst\|.nullslast]`, comma-joined |
//! | `limit`, `offset` | result window |
//! | `and=(...)`, `or=(...)` | logical group, nestable |
//! | `not.and=(...)`, `not.or=(...)` | negated group |
//! | `col=op.value` | atomic filter |
//! | `col.op=value` | atomic filter, dotted-key form |
//!
//! Reserved keys win over column names; a column that collides with a
//! reserved key is reachable through the dotted-key form (`select.eq=x`).
//! Values never enter SQL text; they stay tokens until the emitter binds
//! them as parameters.

use litrest_common::{GatewayError, Result};

/// Atomic comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    In,
    Is,
}

impl FilterOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "eq" => Some(Self::Eq),
            "neq" => Some(Self::Neq),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "like" => Some(Self::Like),
            "ilike" => Some(Self::ILike),
            "in" => Some(Self::In),
            "is" => Some(Self::Is),
            _ => None,
        }
    }
}

/// Right-hand side of an atomic comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Literal(String),
    List(Vec<String>),
    Null,
    NotNull,
}

/// Tree of AND/OR/NOT over atomic comparisons
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Atom {
        column: String,
        op: FilterOp,
        value: FilterValue,
    },
    Group {
        /// true joins children with OR, false with AND
        any: bool,
        children: Vec<FilterNode>,
    },
    Not(Box<FilterNode>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

/// One ordering key
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub column: String,
    pub descending: bool,
    pub nulls: Option<NullsOrder>,
}

/// One projection item as written, before schema resolution
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    All,
    Column(String),
    Embed {
        name: String,
        items: Vec<SelectItem>,
    },
}

/// Everything the query string said
#[derive(Debug, Clone, Default)]
pub struct ParsedQuery {
    pub select: Vec<SelectItem>,
    pub filters: Vec<FilterNode>,
    pub order: Vec<OrderKey>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Parse a raw (still percent-encoded) query string
pub fn parse_query(raw: &str) -> Result<ParsedQuery> {
    let mut parsed = ParsedQuery::default();

    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        let key = key.as_ref();
        let value = value.as_ref();
        match key {
            "select" => parsed.select = parse_select(value)?,
            "order" => parsed.order = parse_order(value)?,
            "limit" => {
                parsed.limit = Some(value.parse().map_err(|_| {
                    GatewayError::Validation(format!("invalid limit: {value}"))
                })?)
            }
            "offset" => {
                parsed.offset = Some(value.parse().map_err(|_| {
                    GatewayError::Validation(format!("invalid offset: {value}"))
                })?)
            }
            "and" => parsed.filters.push(parse_group(value, false)?),
            "or" => parsed.filters.push(parse_group(value, true)?),
            "not.and" => parsed
                .filters
                .push(FilterNode::Not(Box::new(parse_group(value, false)?))),
            "not.or" => parsed
                .filters
                .push(FilterNode::Not(Box::new(parse_group(value, true)?))),
            // The bearer token travels out of band, never as a filter
            "token" => {}
            _ if key.contains('.') => parsed.filters.push(parse_dotted_key(key, value)?),
            _ => parsed.filters.push(parse_value_form(key, value)?),
        }
    }

    Ok(parsed)
}

/// `col.op=value` and `col.not.op=value`
fn parse_dotted_key(key: &str, value: &str) -> Result<FilterNode> {
    let (column, rest) = key
        .split_once('.')
        .ok_or_else(|| GatewayError::Validation(format!("invalid filter key: {key}")))?;
    let (negated, op_token) = match rest.strip_prefix("not.") {
        Some(op) => (true, op),
        None => (false, rest),
    };
    let op = FilterOp::parse(op_token)
        .ok_or_else(|| GatewayError::UnknownOperator(op_token.to_string()))?;
    let atom = atom(column, op, value)?;
    Ok(if negated {
        FilterNode::Not(Box::new(atom))
    } else {
        atom
    })
}

/// `col=op.value` and `col=not.op.value`
fn parse_value_form(column: &str, value: &str) -> Result<FilterNode> {
    let (negated, rest) = match value.strip_prefix("not.") {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (op_token, literal) = rest.split_once('.').ok_or_else(|| {
        GatewayError::Validation(format!("invalid filter for {column}: {value}"))
    })?;
    let op = FilterOp::parse(op_token)
        .ok_or_else(|| GatewayError::UnknownOperator(op_token.to_string()))?;
    let node = atom(column, op, literal)?;
    Ok(if negated {
        FilterNode::Not(Box::new(node))
    } else {
        node
    })
}

fn atom(column: &str, op: FilterOp, raw: &str) -> Result<FilterNode> {
    let value = match op {
        FilterOp::In => {
            let inner = raw
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .unwrap_or(raw);
            let items = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|s| s.trim().to_string()).collect()
            };
            FilterValue::List(items)
        }
        FilterOp::Is => match raw.to_ascii_lowercase().as_str() {
            "null" => FilterValue::Null,
            "notnull" => FilterValue::NotNull,
            other => {
                return Err(GatewayError::Validation(format!(
                    "is accepts only null or notnull, got: {other}"
                )))
            }
        },
        _ => FilterValue::Literal(raw.to_string()),
    };
    Ok(FilterNode::Atom {
        column: column.to_string(),
        op,
        value,
    })
}

/// `( clause , clause , ... )` with nested `and(...)` / `or(...)` groups
fn parse_group(raw: &str, any: bool) -> Result<FilterNode> {
    let inner = raw
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| {
            GatewayError::Validation(format!(
                "logical group must be wrapped in parentheses: {raw}"
            ))
        })?;

    let mut children = Vec::new();
    for clause in split_top_level(inner) {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        children.push(parse_group_clause(clause)?);
    }
    if children.is_empty() {
        return Err(GatewayError::Validation(
            "empty logical group".to_string(),
        ));
    }
    Ok(FilterNode::Group { any, children })
}

fn parse_group_clause(clause: &str) -> Result<FilterNode> {
    if let Some(rest) = clause.strip_prefix("and(") {
        return parse_group(&format!("({rest}"), false);
    }
    if let Some(rest) = clause.strip_prefix("or(") {
        return parse_group(&format!("({rest}"), true);
    }
    if let Some(rest) = clause.strip_prefix("not.and(") {
        return Ok(FilterNode::Not(Box::new(parse_group(
            &format!("({rest}"),
            false,
        )?)));
    }
    if let Some(rest) = clause.strip_prefix("not.or(") {
        return Ok(FilterNode::Not(Box::new(parse_group(
            &format!("({rest}"),
            true,
        )?)));
    }

    // Atom: col[.not].op.value
    let mut parts = clause.splitn(2, '.');
    let column = parts.next().unwrap_or_default();
    let rest = parts.next().ok_or_else(|| {
        GatewayError::Validation(format!("invalid clause in logical group: {clause}"))
    })?;
    let (negated, rest) = match rest.strip_prefix("not.") {
        Some(r) => (true, r),
        None => (false, rest),
    };
    let (op_token, literal) = rest.split_once('.').ok_or_else(|| {
        GatewayError::Validation(format!("invalid clause in logical group: {clause}"))
    })?;
    let op = FilterOp::parse(op_token)
        .ok_or_else(|| GatewayError::UnknownOperator(op_token.to_string()))?;
    let node = atom(column, op, literal)?;
    Ok(if negated {
        FilterNode::Not(Box::new(node))
    } else {
        node
    })
}

/// Split on commas not nested inside parentheses
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_select(raw: &str) -> Result<Vec<SelectItem>> {
    let mut items = Vec::new();
    for part in split_top_level(raw) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        items.push(parse_select_item(part)?);
    }
    if items.is_empty() {
        return Err(GatewayError::Validation("empty select list".to_string()));
    }
    Ok(items)
}

fn parse_select_item(part: &str) -> Result<SelectItem> {
    if part == "*" {
        return Ok(SelectItem::All);
    }
    if let Some(open) = part.find('(') {
        let name = &part[..open];
        let rest = &part[open + 1..];
        let inner = rest.strip_suffix(')').ok_or_else(|| {
            GatewayError::Validation(format!("unbalanced parentheses in select: {part}"))
        })?;
        let items = if inner.is_empty() {
            vec![SelectItem::All]
        } else {
            parse_select(inner)?
        };
        return Ok(SelectItem::Embed {
            name: name.to_string(),
            items,
        });
    }
    Ok(SelectItem::Column(part.to_string()))
}

fn parse_order(raw: &str) -> Result<Vec<OrderKey>> {
    let mut keys = Vec::new();
    for clause in raw.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let mut parts = clause.split('.');
        let column = parts.next().unwrap_or_default().to_string();
        let mut key = OrderKey {
            column,
            descending: false,
            nulls: None,
        };
        for modifier in parts {
            match modifier {
                "asc" => key.descending = false,
                "desc" => key.descending = true,
                "nullsfirst" => key.nulls = Some(NullsOrder::First),
                "nullslast" => key.nulls = Some(NullsOrder::Last),
                other => {
                    return Err(GatewayError::Validation(format!(
                        "unknown order modifier: {other}"
                    )))
                }
            }
        }
        keys.push(key);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom_of(node: &FilterNode) -> (&str, FilterOp, &FilterValue) {
        match node {
            FilterNode::Atom { column, op, value } => (column.as_str(), *op, value),
            other => panic!("expected atom, got {other:?}"),
        }
    }

    #[test]
    fn parses_postgrest_value_form() {
        let q = parse_query("id=eq.1&name=like.john*").unwrap();
        assert_eq!(q.filters.len(), 2);
        let (col, op, value) = atom_of(&q.filters[0]);
        assert_eq!((col, op), ("id", FilterOp::Eq));
        assert_eq!(value, &FilterValue::Literal("1".into()));
        let (col, op, value) = atom_of(&q.filters[1]);
        assert_eq!((col, op), ("name", FilterOp::Like));
        assert_eq!(value, &FilterValue::Literal("john*".into()));
    }

    #[test]
    fn parses_dotted_key_form() {
        let q = parse_query("age.gte=21").unwrap();
        let (col, op, value) = atom_of(&q.filters[0]);
        assert_eq!((col, op), ("age", FilterOp::Gte));
        assert_eq!(value, &FilterValue::Literal("21".into()));
    }

    #[test]
    fn reserved_keys_win_and_dotted_form_disambiguates() {
        // `select` the reserved key
        let q = parse_query("select=id,name").unwrap();
        assert!(q.filters.is_empty());
        assert_eq!(q.select.len(), 2);

        // A column actually named `select`, reached via the dotted form
        let q = parse_query("select.eq=frob").unwrap();
        let (col, op, _) = atom_of(&q.filters[0]);
        assert_eq!((col, op), ("select", FilterOp::Eq));
    }

    #[test]
    fn value_dots_stay_in_the_literal() {
        let q = parse_query("price=gt.1.5").unwrap();
        let (_, _, value) = atom_of(&q.filters[0]);
        assert_eq!(value, &FilterValue::Literal("1.5".into()));
    }

    #[test]
    fn parses_in_lists_with_and_without_parens() {
        let q = parse_query("id=in.(1,2,3)").unwrap();
        let (_, op, value) = atom_of(&q.filters[0]);
        assert_eq!(op, FilterOp::In);
        assert_eq!(
            value,
            &FilterValue::List(vec!["1".into(), "2".into(), "3".into()])
        );

        let q = parse_query("id=in.4,5").unwrap();
        let (_, _, value) = atom_of(&q.filters[0]);
        assert_eq!(value, &FilterValue::List(vec!["4".into(), "5".into()]));
    }

    #[test]
    fn parses_is_null_and_rejects_other_is_values() {
        let q = parse_query("deleted_at=is.null&email=is.notnull").unwrap();
        assert_eq!(atom_of(&q.filters[0]).2, &FilterValue::Null);
        assert_eq!(atom_of(&q.filters[1]).2, &FilterValue::NotNull);

        let err = parse_query("x=is.maybe").unwrap_err();
        assert_eq!(err.kind(), litrest_common::ErrorKind::Validation);
    }

    #[test]
    fn negation_wraps_atoms_and_groups() {
        let q = parse_query("id=not.eq.1").unwrap();
        assert!(matches!(&q.filters[0], FilterNode::Not(_)));

        let q = parse_query("not.or=(a.eq.1,b.eq.2)").unwrap();
        match &q.filters[0] {
            FilterNode::Not(inner) => match inner.as_ref() {
                FilterNode::Group { any, children } => {
                    assert!(*any);
                    assert_eq!(children.len(), 2);
                }
                other => panic!("expected group, got {other:?}"),
            },
            other => panic!("expected not, got {other:?}"),
        }
    }

    #[test]
    fn parses_nested_logical_groups() {
        let q = parse_query("and=(published.eq.true,or(id.eq.1,id.eq.3))").unwrap();
        match &q.filters[0] {
            FilterNode::Group { any: false, children } => {
                assert_eq!(children.len(), 2);
                assert!(matches!(
                    &children[1],
                    FilterNode::Group { any: true, .. }
                ));
            }
            other => panic!("expected and-group, got {other:?}"),
        }
    }

    #[test]
    fn group_atoms_support_inner_negation() {
        let q = parse_query("and=(a.not.eq.1,b.eq.2)").unwrap();
        match &q.filters[0] {
            FilterNode::Group { children, .. } => {
                assert!(matches!(&children[0], FilterNode::Not(_)));
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = parse_query("id=matches.1").unwrap_err();
        assert_eq!(err.details(), Some("unknown_operator"));
    }

    #[test]
    fn parses_order_with_modifiers() {
        let q = parse_query("order=created_at.desc.nullslast,id").unwrap();
        assert_eq!(q.order.len(), 2);
        assert!(q.order[0].descending);
        assert_eq!(q.order[0].nulls, Some(NullsOrder::Last));
        assert!(!q.order[1].descending);
    }

    #[test]
    fn parses_window_and_rejects_garbage() {
        let q = parse_query("limit=10&offset=20").unwrap();
        assert_eq!(q.limit, Some(10));
        assert_eq!(q.offset, Some(20));
        assert!(parse_query("limit=ten").is_err());
        assert!(parse_query("offset=-1").is_err());
    }

    #[test]
    fn parses_select_with_embeds() {
        let q = parse_query("select=id,name,posts(title,created_at),tags()").unwrap();
        assert_eq!(q.select.len(), 4);
        match &q.select[2] {
            SelectItem::Embed { name, items } => {
                assert_eq!(name, "posts");
                assert_eq!(items.len(), 2);
            }
            other => panic!("expected embed, got {other:?}"),
        }
        // Empty parens mean the relation's full projection
        assert_eq!(
            q.select[3],
            SelectItem::Embed {
                name: "tags".into(),
                items: vec![SelectItem::All]
            }
        );
    }

    #[test]
    fn parses_nested_embeds() {
        let q = parse_query("select=id,posts(title,comments(body))").unwrap();
        match &q.select[1] {
            SelectItem::Embed { items, .. } => match &items[1] {
                SelectItem::Embed { name, items } => {
                    assert_eq!(name, "comments");
                    assert_eq!(items, &vec![SelectItem::Column("body".into())]);
                }
                other => panic!("expected nested embed, got {other:?}"),
            },
            other => panic!("expected embed, got {other:?}"),
        }
    }

    #[test]
    fn token_parameter_is_not_a_filter() {
        let q = parse_query("token=abc.def.ghi&id=eq.1").unwrap();
        assert_eq!(q.filters.len(), 1);
    }

    #[test]
    fn percent_encoding_is_decoded() {
        let q = parse_query("name=eq.John%20Doe").unwrap();
        let (_, _, value) = atom_of(&q.filters[0]);
        assert_eq!(value, &FilterValue::Literal("John Doe".into()));
    }
}
