use std::collections::{BTreeSet, HashSet};

use once_cell::unsync::OnceCell;
use regex::Regex;

use crate::index::{extract_kv_pairs, tokenize};
use crate::store::{Record, VaultId};

/// Numeric comparison operators of `key>value` predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    pub fn eval(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
        }
    }
}

/// A compiled value pattern: a glob (from a quoted `~` operand) or a raw
/// regular expression. Globs are anchored, regexes search unanchored.
#[derive(Debug, Clone)]
pub struct MatchPattern {
    pub source: String,
    pub is_glob: bool,
    re: Regex,
}

impl MatchPattern {
    pub(crate) fn new(source: String, is_glob: bool, re: Regex) -> Self {
        MatchPattern { source, is_glob, re }
    }

    pub fn matches(&self, value: &str) -> bool {
        self.re.is_match(value)
    }
}

impl PartialEq for MatchPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.is_glob == other.is_glob
    }
}

/// Compiled filter expression tree.
///
/// `StoreIs` nodes survive compilation and are resolved to `All` /
/// `Nothing` when the filter is bound to a concrete vault; a bound
/// expression evaluates records without any store context.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// Matches every record (`*`).
    All,
    /// Matches nothing; produced by store binding, never by parsing.
    Nothing,
    /// Token lookup against the raw payload.
    Token(String),
    /// Exact attribute or extracted key=value match.
    KvEq { key: String, value: String },
    /// Pattern match on the values under `key`.
    KvPattern { key: String, pattern: MatchPattern },
    /// Numeric comparison on the values under `key`.
    Cmp { key: String, op: CmpOp, value: f64 },
    /// Store scoping term (`store=ID`).
    StoreIs(String),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

/// Per-record evaluation context. Token and kv extraction are lazy and
/// shared across all predicates of one expression, so a record is
/// tokenized at most once no matter how many terms the filter has.
pub struct MatchCtx<'a> {
    rec: &'a Record,
    tokens: OnceCell<HashSet<String>>,
    kvs: OnceCell<Vec<(String, String)>>,
}

impl<'a> MatchCtx<'a> {
    pub fn new(rec: &'a Record) -> Self {
        MatchCtx {
            rec,
            tokens: OnceCell::new(),
            kvs: OnceCell::new(),
        }
    }

    pub fn record(&self) -> &Record {
        self.rec
    }

    fn tokens(&self) -> &HashSet<String> {
        self.tokens
            .get_or_init(|| tokenize(&self.rec.raw).into_iter().collect())
    }

    fn kvs(&self) -> &[(String, String)] {
        self.kvs.get_or_init(|| extract_kv_pairs(&self.rec.raw))
    }

    /// All values observed under `key`: the attribute value, then any
    /// extracted kv pair values.
    fn values_for<'b>(&'b self, key: &'b str) -> impl Iterator<Item = &'b str> + 'b {
        let attr = self.rec.attrs.get(key).map(|v| v.as_str());
        let kvs = self
            .kvs()
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str());
        attr.into_iter().chain(kvs)
    }
}

impl FilterExpr {
    /// Evaluate against one record. Unbound `StoreIs` nodes evaluate to
    /// true (the ingest router and query planner bind them beforehand).
    pub fn matches(&self, ctx: &MatchCtx) -> bool {
        match self {
            FilterExpr::All => true,
            FilterExpr::Nothing => false,
            FilterExpr::Token(token) => ctx.tokens().contains(token),
            FilterExpr::KvEq { key, value } => ctx.values_for(key).any(|v| v == value),
            FilterExpr::KvPattern { key, pattern } => {
                ctx.values_for(key).any(|v| pattern.matches(v))
            }
            FilterExpr::Cmp { key, op, value } => ctx
                .values_for(key)
                .any(|v| v.parse::<f64>().map(|n| op.eval(n, *value)).unwrap_or(false)),
            FilterExpr::StoreIs(_) => true,
            FilterExpr::And(children) => children.iter().all(|c| c.matches(ctx)),
            FilterExpr::Or(children) => children.iter().any(|c| c.matches(ctx)),
            FilterExpr::Not(child) => !child.matches(ctx),
        }
    }

    /// Replace `StoreIs` nodes with `All` / `Nothing` for one vault.
    pub fn bind_store(&self, id: &VaultId, name: &str) -> FilterExpr {
        match self {
            FilterExpr::StoreIs(store) => {
                if store == &id.to_string() || store == name {
                    FilterExpr::All
                } else {
                    FilterExpr::Nothing
                }
            }
            FilterExpr::And(children) => {
                FilterExpr::And(children.iter().map(|c| c.bind_store(id, name)).collect())
            }
            FilterExpr::Or(children) => {
                FilterExpr::Or(children.iter().map(|c| c.bind_store(id, name)).collect())
            }
            FilterExpr::Not(child) => FilterExpr::Not(Box::new(child.bind_store(id, name))),
            other => other.clone(),
        }
    }

    /// Store names/ids mentioned anywhere in the expression.
    pub fn collect_stores(&self, out: &mut BTreeSet<String>) {
        match self {
            FilterExpr::StoreIs(store) => {
                out.insert(store.clone());
            }
            FilterExpr::And(children) | FilterExpr::Or(children) => {
                for c in children {
                    c.collect_stores(out);
                }
            }
            FilterExpr::Not(child) => child.collect_stores(out),
            _ => {}
        }
    }

    /// Whether the expression can never match anything (after binding).
    pub fn is_nothing(&self) -> bool {
        match self {
            FilterExpr::Nothing => true,
            FilterExpr::And(children) => children.iter().any(|c| c.is_nothing()),
            FilterExpr::Or(children) => {
                !children.is_empty() && children.iter().all(|c| c.is_nothing())
            }
            _ => false,
        }
    }
}

/// Declarative description of the index lookups a filter can be answered
/// with, mirroring the expression tree. `Scan` marks subtrees the indexes
/// cannot answer; the planner then falls back to evaluating the expression
/// over every candidate record.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// Every position is a candidate (match-all term).
    All,
    /// No position can match.
    Nothing,
    /// The indexes cannot narrow this term.
    Scan,
    /// Token index lookup.
    Token(String),
    /// Attribute-pair and kv-pair index lookup.
    Kv { key: String, value: String },
    And(Vec<Probe>),
    Or(Vec<Probe>),
    Not(Box<Probe>),
}

impl FilterExpr {
    /// Derive the probe tree for the planner.
    pub fn derive_probes(&self) -> Probe {
        match self {
            FilterExpr::All => Probe::All,
            FilterExpr::Nothing => Probe::Nothing,
            FilterExpr::Token(token) => Probe::Token(token.clone()),
            FilterExpr::KvEq { key, value } => Probe::Kv {
                key: key.clone(),
                value: value.clone(),
            },
            FilterExpr::KvPattern { .. } => Probe::Scan,
            FilterExpr::Cmp { .. } => Probe::Scan,
            FilterExpr::StoreIs(_) => Probe::All,
            FilterExpr::And(children) => {
                Probe::And(children.iter().map(|c| c.derive_probes()).collect())
            }
            FilterExpr::Or(children) => {
                Probe::Or(children.iter().map(|c| c.derive_probes()).collect())
            }
            FilterExpr::Not(child) => Probe::Not(Box::new(child.derive_probes())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(raw: &str) -> Record {
        Record::new(raw.as_bytes().to_vec())
    }

    #[test]
    fn token_and_kv_matching() {
        let record = rec("user login ok user=alice");
        let ctx = MatchCtx::new(&record);

        assert!(FilterExpr::Token("login".into()).matches(&ctx));
        assert!(!FilterExpr::Token("logout".into()).matches(&ctx));
        assert!(FilterExpr::KvEq {
            key: "user".into(),
            value: "alice".into()
        }
        .matches(&ctx));
    }

    #[test]
    fn attrs_and_extracted_kvs_both_count() {
        let mut record = rec("latency=250");
        record.attrs.insert("host".into(), "web1".into());
        let ctx = MatchCtx::new(&record);

        assert!(FilterExpr::KvEq {
            key: "host".into(),
            value: "web1".into()
        }
        .matches(&ctx));
        assert!(FilterExpr::Cmp {
            key: "latency".into(),
            op: CmpOp::Ge,
            value: 250.0
        }
        .matches(&ctx));
        assert!(!FilterExpr::Cmp {
            key: "latency".into(),
            op: CmpOp::Gt,
            value: 250.0
        }
        .matches(&ctx));
    }

    #[test]
    fn store_binding() {
        let id = VaultId::new_v4();
        let expr = FilterExpr::And(vec![
            FilterExpr::StoreIs("audit".into()),
            FilterExpr::Token("error".into()),
        ]);

        let bound = expr.bind_store(&id, "audit");
        assert_eq!(
            bound,
            FilterExpr::And(vec![FilterExpr::All, FilterExpr::Token("error".into())])
        );

        let other = expr.bind_store(&id, "metrics");
        assert!(other.is_nothing());
    }

    #[test]
    fn probe_shapes() {
        let expr = FilterExpr::And(vec![
            FilterExpr::Token("error".into()),
            FilterExpr::Cmp {
                key: "latency".into(),
                op: CmpOp::Gt,
                value: 1.0,
            },
        ]);
        assert_eq!(
            expr.derive_probes(),
            Probe::And(vec![Probe::Token("error".into()), Probe::Scan])
        );
    }
}
