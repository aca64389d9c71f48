use std::collections::BTreeSet;

use regex::Regex;

use crate::filter::{
    parse_raw, CmpOp, FilterExpr, MatchCtx, MatchPattern, Probe, RawExpr, RawOp,
};
use crate::store::{Record, VaultId};
use crate::{Error, Result};

/// A parsed, validated filter: per-record matcher plus store scope plus
/// probe derivation. Immutable once compiled; the orchestrator swaps whole
/// sets of these on configuration changes.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    source: String,
    expr: FilterExpr,
    stores: BTreeSet<String>,
}

impl CompiledFilter {
    pub fn compile(input: &str) -> Result<CompiledFilter> {
        let raw = parse_raw(input)?;
        let expr = lower(&raw)?;
        let mut stores = BTreeSet::new();
        expr.collect_stores(&mut stores);
        Ok(CompiledFilter {
            source: input.trim().to_owned(),
            expr,
            stores,
        })
    }

    /// The `*` filter.
    pub fn match_all() -> CompiledFilter {
        CompiledFilter {
            source: "*".to_owned(),
            expr: FilterExpr::All,
            stores: BTreeSet::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &FilterExpr {
        &self.expr
    }

    /// The store scope: `None` means the filter applies to every vault.
    pub fn stores(&self) -> Option<&BTreeSet<String>> {
        if self.stores.is_empty() {
            None
        } else {
            Some(&self.stores)
        }
    }

    /// Whether the filter's store scope admits this vault.
    pub fn applies_to_store(&self, id: &VaultId, name: &str) -> bool {
        self.stores.is_empty()
            || self.stores.contains(&id.to_string())
            || self.stores.contains(name)
    }

    pub fn matches(&self, rec: &Record) -> bool {
        self.expr.matches(&MatchCtx::new(rec))
    }

    /// Specialize the filter for one vault, resolving store terms.
    pub fn bind_store(&self, id: &VaultId, name: &str) -> CompiledFilter {
        CompiledFilter {
            source: self.source.clone(),
            expr: self.expr.bind_store(id, name),
            stores: BTreeSet::new(),
        }
    }

    pub fn derive_probes(&self) -> Probe {
        self.expr.derive_probes()
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self.expr, FilterExpr::All)
    }

    pub fn is_nothing(&self) -> bool {
        self.expr.is_nothing()
    }
}

fn lower(raw: &RawExpr) -> Result<FilterExpr> {
    Ok(match raw {
        RawExpr::All => FilterExpr::All,
        RawExpr::Token(token) => FilterExpr::Token(token.clone()),
        RawExpr::Predicate {
            key,
            op,
            value,
            quoted,
        } => lower_predicate(key, *op, value, *quoted)?,
        RawExpr::And(children) => {
            FilterExpr::And(children.iter().map(lower).collect::<Result<Vec<_>>>()?)
        }
        RawExpr::Or(children) => {
            FilterExpr::Or(children.iter().map(lower).collect::<Result<Vec<_>>>()?)
        }
        RawExpr::Not(child) => FilterExpr::Not(Box::new(lower(child)?)),
    })
}

fn lower_predicate(key: &str, op: RawOp, value: &str, quoted: bool) -> Result<FilterExpr> {
    match op {
        RawOp::Eq => {
            if key == "store" {
                Ok(FilterExpr::StoreIs(value.to_owned()))
            } else {
                Ok(FilterExpr::KvEq {
                    key: key.to_owned(),
                    value: value.to_owned(),
                })
            }
        }
        RawOp::Tilde => {
            let pattern = if quoted {
                compile_glob(value)?
            } else {
                compile_regex(value)?
            };
            Ok(FilterExpr::KvPattern {
                key: key.to_owned(),
                pattern,
            })
        }
        RawOp::Gt | RawOp::Ge | RawOp::Lt | RawOp::Le => {
            let number: f64 = value.parse().map_err(|_| {
                Error::invalid(format!("'{}' is not a number in comparison on '{}'", value, key))
            })?;
            let op = match op {
                RawOp::Gt => CmpOp::Gt,
                RawOp::Ge => CmpOp::Ge,
                RawOp::Lt => CmpOp::Lt,
                RawOp::Le => CmpOp::Le,
                _ => unreachable!(),
            };
            Ok(FilterExpr::Cmp {
                key: key.to_owned(),
                op,
                value: number,
            })
        }
    }
}

fn compile_regex(source: &str) -> Result<MatchPattern> {
    let re = Regex::new(source)
        .map_err(|err| Error::invalid(format!("bad regex '{}': {}", source, err)))?;
    Ok(MatchPattern::new(source.to_owned(), false, re))
}

/// Translate a glob (`*`, `?`) into an anchored regex.
fn compile_glob(source: &str) -> Result<MatchPattern> {
    let mut re = String::with_capacity(source.len() + 8);
    re.push('^');
    for c in source.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    let re = Regex::new(&re)
        .map_err(|err| Error::invalid(format!("bad glob '{}': {}", source, err)))?;
    Ok(MatchPattern::new(source.to_owned(), true, re))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(raw: &str) -> Record {
        Record::new(raw.as_bytes().to_vec())
    }

    #[test]
    fn boolean_evaluation() {
        let f = CompiledFilter::compile("user AND ok").unwrap();
        assert!(f.matches(&rec("user login ok")));
        assert!(!f.matches(&rec("user login failed")));

        let f = CompiledFilter::compile("error OR login").unwrap();
        assert!(f.matches(&rec("error network")));
        assert!(f.matches(&rec("user login ok")));
        assert!(!f.matches(&rec("all quiet")));

        let f = CompiledFilter::compile("NOT debug").unwrap();
        assert!(f.matches(&rec("info started")));
        assert!(!f.matches(&rec("debug noisy")));
    }

    #[test]
    fn glob_and_regex_patterns() {
        let f = CompiledFilter::compile("level~\"err*\"").unwrap();
        let mut r = rec("something");
        r.attrs.insert("level".into(), "error".into());
        assert!(f.matches(&r));
        r.attrs.insert("level".into(), "warning".into());
        assert!(!f.matches(&r));

        // unquoted operand is a regex, unanchored
        let f = CompiledFilter::compile("path~v[0-9]+").unwrap();
        let mut r = rec("x");
        r.attrs.insert("path".into(), "/api/v2/users".into());
        assert!(f.matches(&r));

        assert!(CompiledFilter::compile("path~[unclosed").is_err());
    }

    #[test]
    fn numeric_comparisons() {
        let f = CompiledFilter::compile("latency>250").unwrap();
        assert!(f.matches(&rec("req done latency=300")));
        assert!(!f.matches(&rec("req done latency=200")));
        // non-numeric values never match
        assert!(!f.matches(&rec("req done latency=slow")));

        assert!(CompiledFilter::compile("latency>fast").is_err());
    }

    #[test]
    fn store_scoping() {
        let f = CompiledFilter::compile("store=audit error").unwrap();
        let stores = f.stores().unwrap();
        assert!(stores.contains("audit"));

        let id = VaultId::new_v4();
        assert!(f.applies_to_store(&id, "audit"));
        assert!(!f.applies_to_store(&id, "other"));

        let bound = f.bind_store(&id, "audit");
        assert!(bound.matches(&rec("error here")));
        let unbound = f.bind_store(&id, "other");
        assert!(!unbound.matches(&rec("error here")));
    }

    #[test]
    fn match_all_and_probes() {
        let f = CompiledFilter::compile("*").unwrap();
        assert!(f.is_match_all());
        assert!(f.matches(&rec("")));
        assert_eq!(f.derive_probes(), Probe::All);

        let f = CompiledFilter::compile("error host=web1").unwrap();
        assert_eq!(
            f.derive_probes(),
            Probe::And(vec![
                Probe::Token("error".into()),
                Probe::Kv {
                    key: "host".into(),
                    value: "web1".into()
                },
            ])
        );
    }
}
