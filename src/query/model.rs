use crate::filter::CompiledFilter;
use crate::query::Stage;
use crate::store::{Record, RecordRef};
use crate::{Error, Result};

/// A record found by a query, with its stable address.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub rec: Record,
    pub at: RecordRef,
}

/// One multi-vault query.
///
/// Time bounds are half-open `[start, end)` on the respective timestamp.
/// `reverse = true` (the default) iterates newest-first.
#[derive(Debug, Clone)]
pub struct Query {
    pub filter: Option<CompiledFilter>,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub ingest_start: Option<i64>,
    pub ingest_end: Option<i64>,
    pub source_start: Option<i64>,
    pub source_end: Option<i64>,
    pub limit: Option<usize>,
    pub reverse: bool,
    pub pipeline: Vec<Stage>,
}

impl Default for Query {
    fn default() -> Query {
        Query {
            filter: None,
            start: None,
            end: None,
            ingest_start: None,
            ingest_end: None,
            source_start: None,
            source_end: None,
            limit: None,
            reverse: true,
            pipeline: Vec::new(),
        }
    }
}

impl Query {
    /// An unfiltered newest-first query.
    pub fn all() -> Query {
        Query::default()
    }

    /// Parse a full query string: a filter expression optionally followed
    /// by `|`-separated pipeline stages.
    ///
    /// ```text
    /// error host=web1 | where latency > 100 | stats count by host
    /// ```
    pub fn parse(text: &str) -> Result<Query> {
        let mut segments = split_pipeline(text);
        if segments.is_empty() {
            segments.push(String::new());
        }

        let head = segments.remove(0);
        let head = head.trim();
        let filter = if head.is_empty() || head == "*" {
            None
        } else {
            Some(CompiledFilter::compile(head)?)
        };

        let mut pipeline = Vec::with_capacity(segments.len());
        for segment in segments {
            pipeline.push(Stage::parse(&segment)?);
        }

        Ok(Query {
            filter,
            pipeline,
            reverse: true,
            ..Query::default()
        })
    }

    pub fn with_filter(mut self, filter: CompiledFilter) -> Query {
        self.filter = Some(filter);
        self
    }

    pub fn between(mut self, start: Option<i64>, end: Option<i64>) -> Query {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Query {
        self.limit = Some(limit);
        self
    }

    /// Oldest-first iteration.
    pub fn forward(mut self) -> Query {
        self.reverse = false;
        self
    }

    /// `true` when the query has no predicates beyond time bounds and
    /// vault scoping - the histogram fast path applies.
    pub fn is_unfiltered(&self) -> bool {
        let no_expr = match &self.filter {
            None => true,
            Some(f) => f.is_match_all() || f.expr() == &crate::filter::FilterExpr::All,
        };
        no_expr
            && self.ingest_start.is_none()
            && self.ingest_end.is_none()
            && self.source_start.is_none()
            && self.source_end.is_none()
    }

    /// Degenerate time range (`start >= end`) can never match.
    pub fn is_empty_range(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start >= end,
            _ => false,
        }
    }

    /// Reject pipeline stages that need complete input, for follow mode.
    pub fn check_streamable(&self) -> Result<()> {
        for stage in &self.pipeline {
            if stage.requires_complete_input() {
                return Err(Error::precondition(format!(
                    "'{}' is not allowed in follow mode",
                    stage.keyword()
                )));
            }
        }
        Ok(())
    }
}

/// Split a query string on top-level `|`, respecting double quotes.
fn split_pipeline(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '|' if !in_quotes => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_filter_only() {
        let q = Query::parse("error host=web1").unwrap();
        assert!(q.filter.is_some());
        assert!(q.pipeline.is_empty());
        assert!(q.reverse);
    }

    #[test]
    fn parse_star_is_unfiltered() {
        let q = Query::parse("*").unwrap();
        assert!(q.is_unfiltered());
    }

    #[test]
    fn parse_with_pipeline() {
        let q = Query::parse("error | head 10").unwrap();
        assert_eq!(q.pipeline.len(), 1);
    }

    #[test]
    fn pipe_inside_quotes_is_not_a_separator() {
        let q = Query::parse("msg=\"a|b\"").unwrap();
        assert!(q.pipeline.is_empty());
    }

    #[test]
    fn empty_range_detection() {
        let q = Query::all().between(Some(100), Some(100));
        assert!(q.is_empty_range());
        let q = Query::all().between(Some(100), Some(200));
        assert!(!q.is_empty_range());
    }

    #[test]
    fn bad_stage_is_invalid_argument() {
        assert!(matches!(
            Query::parse("* | frobnicate"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
