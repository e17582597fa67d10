//! The request-to-query compiler
//!
//! `filter` parses the query-string grammar, `plan` validates it against the
//! schema cache, `emit` renders parameterized SQL, `exec` runs it and shapes
//! the rows. `schema` owns the introspection cache the planner reads.

pub mod emit;
pub mod exec;
pub mod filter;
pub mod plan;
pub mod schema;
