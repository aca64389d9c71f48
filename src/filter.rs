//! Filter expression language.
//!
//! Filters route records into vaults on the ingest path and select records
//! on the query path. The same compiled form serves both: a per-record
//! matcher, an optional store scope, and a set of index probes the query
//! planner uses to avoid scanning.
//!
//! Grammar (whitespace separates terms; juxtaposition is AND):
//!
//! ```text
//! error NOT debug
//! user AND (login OR logout)
//! host=web1 level~"err*"
//! path~^/api/v[0-9]+ latency>250
//! store=audit failed
//! *
//! ```

mod ast;
pub use ast::*;

mod parse;
pub use parse::*;

mod compile;
pub use compile::*;

/// Human-readable description of the filter and pipeline syntax, served to
/// clients asking for help.
pub fn syntax() -> &'static str {
    r#"FILTER SYNTAX

  term                 match records whose payload contains the token
  key=value            exact attribute or key=value pair match
  key~regex            attribute value matches the regular expression
  key~"glob*"          attribute value matches the glob (quoted)
  key>n key<n          numeric comparison (also >=, <=)
  store=NAME           restrict the query to one vault (id or name)
  *                    match everything

  a AND b, a b         both must match
  a OR b               either matches
  NOT a                negation
  ( ... )              grouping

PIPELINE SYNTAX (appended after the filter, separated by '|'):

  where <expr>             keep records where the expression is true
  eval name = <expr>       compute an attribute
  fields a, b              keep only the listed attributes
  rename a as b            rename an attribute
  sort by attr [asc|desc]  sort (complete input required)
  head N / tail N          first / last N records
  slice OFF,LEN            window into the record list
  stats <agg>(x) by k      aggregate: count, sum, avg, min, max
  timechart 1m             count per time bucket
  raw                      force raw record output
"#
}
