//! Post-processing pipeline: stages applied downstream of the record
//! stream, written `filter | stage | stage | ...`.

use std::collections::BTreeMap;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, opt, verify},
    multi::separated_list,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::query::{Expr, Hit, Value};
use crate::tools::time;
use crate::{Error, Result};

/// One pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// `where <expr>` - keep records where the expression is truthy.
    Where(Expr),
    /// `eval name = <expr>` - add or overwrite an attribute.
    Eval { name: String, expr: Expr },
    /// `fields a, b` - keep only the listed attributes.
    Fields(Vec<String>),
    /// `rename a as b` - rename attributes.
    Rename(Vec<(String, String)>),
    /// `sort by attr [asc|desc]`.
    SortBy { key: String, desc: bool },
    /// `head n`.
    Head(usize),
    /// `tail n`.
    Tail(usize),
    /// `slice off,len`.
    Slice { offset: usize, len: usize },
    /// `stats <agg>(field) [as alias], ... [by group, ...]`.
    Stats { aggs: Vec<AggSpec>, by: Vec<GroupSpec> },
    /// `timechart <width>` - shorthand for `stats count by bin(_write_ts, width)`.
    Timechart { width_ns: i64 },
    /// `raw` - force raw record output.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    fn name(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggSpec {
    pub func: AggFunc,
    pub field: Option<String>,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupSpec {
    Field(String),
    /// `bin(field, width)` - bucket a timestamp or numeric field.
    Bin { field: String, width_ns: i64 },
}

impl Stage {
    /// The keyword the stage was written with, for error messages.
    pub fn keyword(&self) -> &'static str {
        match self {
            Stage::Where(_) => "where",
            Stage::Eval { .. } => "eval",
            Stage::Fields(_) => "fields",
            Stage::Rename(_) => "rename",
            Stage::SortBy { .. } => "sort",
            Stage::Head(_) => "head",
            Stage::Tail(_) => "tail",
            Stage::Slice { .. } => "slice",
            Stage::Stats { .. } => "stats",
            Stage::Timechart { .. } => "timechart",
            Stage::Raw => "raw",
        }
    }

    /// Stages that cannot produce output before the input has ended.
    /// These are rejected in follow mode.
    pub fn requires_complete_input(&self) -> bool {
        matches!(
            self,
            Stage::SortBy { .. }
                | Stage::Tail(_)
                | Stage::Slice { .. }
                | Stage::Stats { .. }
                | Stage::Timechart { .. }
        )
    }

    pub fn parse(text: &str) -> Result<Stage> {
        let trimmed = text.trim();
        let (keyword, rest) = match trimmed.find(char::is_whitespace) {
            Some(pos) => (&trimmed[..pos], trimmed[pos..].trim_start()),
            None => (trimmed, ""),
        };

        match keyword {
            "where" => Ok(Stage::Where(Expr::parse(rest)?)),
            "eval" => parse_eval(rest),
            "fields" => parse_fields(rest),
            "rename" => parse_rename(rest),
            "sort" => parse_sort(rest),
            "head" => Ok(Stage::Head(parse_count(rest, "head")?)),
            "tail" => Ok(Stage::Tail(parse_count(rest, "tail")?)),
            "slice" => parse_slice(rest),
            "stats" => parse_stats(rest),
            "timechart" => Ok(Stage::Timechart {
                width_ns: parse_duration(rest.trim())?,
            }),
            "raw" if rest.is_empty() => Ok(Stage::Raw),
            _ => Err(Error::invalid(format!("unknown pipeline stage '{}'", trimmed))),
        }
    }
}

fn parse_eval(rest: &str) -> Result<Stage> {
    let eq = rest
        .find('=')
        .ok_or_else(|| Error::invalid("eval needs 'name = expression'"))?;
    let name = rest[..eq].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::invalid(format!("bad eval target '{}'", name)));
    }
    let expr = Expr::parse(&rest[eq + 1..])?;
    Ok(Stage::Eval {
        name: name.to_owned(),
        expr,
    })
}

fn parse_fields(rest: &str) -> Result<Stage> {
    let fields: Vec<String> = rest
        .split(',')
        .map(|f| f.trim().to_owned())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.is_empty() {
        return Err(Error::invalid("fields needs at least one attribute"));
    }
    Ok(Stage::Fields(fields))
}

fn parse_rename(rest: &str) -> Result<Stage> {
    let mut pairs = Vec::new();
    for part in rest.split(',') {
        let mut words = part.split_whitespace();
        match (words.next(), words.next(), words.next(), words.next()) {
            (Some(from), Some(kw), Some(to), None) if kw == "as" => {
                pairs.push((from.to_owned(), to.to_owned()));
            }
            _ => {
                return Err(Error::invalid(format!(
                    "rename needs 'old as new', got '{}'",
                    part.trim()
                )))
            }
        }
    }
    if pairs.is_empty() {
        return Err(Error::invalid("rename needs at least one mapping"));
    }
    Ok(Stage::Rename(pairs))
}

fn parse_sort(rest: &str) -> Result<Stage> {
    let mut words = rest.split_whitespace();
    match (words.next(), words.next(), words.next(), words.next()) {
        (Some("by"), Some(key), dir, None) => {
            let desc = match dir {
                None | Some("asc") => false,
                Some("desc") => true,
                Some(other) => {
                    return Err(Error::invalid(format!("bad sort direction '{}'", other)))
                }
            };
            Ok(Stage::SortBy {
                key: key.to_owned(),
                desc,
            })
        }
        _ => Err(Error::invalid("sort needs 'by <attr> [asc|desc]'")),
    }
}

fn parse_count(rest: &str, what: &str) -> Result<usize> {
    rest.trim()
        .parse()
        .map_err(|_| Error::invalid(format!("{} needs a record count", what)))
}

fn parse_slice(rest: &str) -> Result<Stage> {
    let mut parts = rest.split(',');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(off), Some(len), None) => {
            let offset = off
                .trim()
                .parse()
                .map_err(|_| Error::invalid("slice needs 'offset,length'"))?;
            let len = len
                .trim()
                .parse()
                .map_err(|_| Error::invalid("slice needs 'offset,length'"))?;
            Ok(Stage::Slice { offset, len })
        }
        _ => Err(Error::invalid("slice needs 'offset,length'")),
    }
}

// ---- stats grammar ----

fn ident(i: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
        |w: &str| w.chars().next().map(|c| !c.is_ascii_digit()).unwrap_or(false),
    )(i)
}

fn ws(i: &str) -> IResult<&str, &str> {
    multispace0(i)
}

fn agg_func(i: &str) -> IResult<&str, AggFunc> {
    alt((
        map(tag("count"), |_| AggFunc::Count),
        map(tag("sum"), |_| AggFunc::Sum),
        map(tag("avg"), |_| AggFunc::Avg),
        map(tag("min"), |_| AggFunc::Min),
        map(tag("max"), |_| AggFunc::Max),
    ))(i)
}

fn agg_spec(i: &str) -> IResult<&str, AggSpec> {
    map(
        tuple((
            agg_func,
            opt(delimited(
                pair(char('('), ws),
                opt(ident),
                pair(ws, char(')')),
            )),
            opt(preceded(
                tuple((multispace1, tag("as"), multispace1)),
                ident,
            )),
        )),
        |(func, field, alias)| {
            let field = field.flatten().map(|f| f.to_owned());
            let alias = alias.map(|a| a.to_owned()).unwrap_or_else(|| match &field {
                Some(f) => format!("{}_{}", func.name(), f),
                None => func.name().to_owned(),
            });
            AggSpec { func, field, alias }
        },
    )(i)
}

fn group_spec(i: &str) -> IResult<&str, GroupSpec> {
    alt((
        map(
            tuple((
                tag("bin"),
                pair(char('('), ws),
                ident,
                tuple((ws, char(','), ws)),
                take_while1(|c: char| !c.is_whitespace() && c != ')'),
                pair(ws, char(')')),
            )),
            |(_, _, field, _, width, _)| GroupSpec::Bin {
                field: field.to_owned(),
                // validated in parse_stats
                width_ns: parse_duration(width).unwrap_or(0),
            },
        ),
        map(ident, |f: &str| GroupSpec::Field(f.to_owned())),
    ))(i)
}

fn stats_body(i: &str) -> IResult<&str, (Vec<AggSpec>, Vec<GroupSpec>)> {
    map(
        tuple((
            separated_list(tuple((ws, char(','), ws)), agg_spec),
            opt(preceded(
                tuple((multispace1, tag("by"), multispace1)),
                separated_list(tuple((ws, char(','), ws)), group_spec),
            )),
        )),
        |(aggs, by)| (aggs, by.unwrap_or_default()),
    )(i)
}

fn parse_stats(rest: &str) -> Result<Stage> {
    let (aggs, by) = match all_consuming(delimited(ws, stats_body, ws))(rest) {
        Ok((_, parsed)) => parsed,
        Err(_) => return Err(Error::invalid(format!("bad stats clause '{}'", rest))),
    };
    if aggs.is_empty() {
        return Err(Error::invalid("stats needs at least one aggregate"));
    }
    for agg in &aggs {
        if agg.field.is_none() && agg.func != AggFunc::Count {
            return Err(Error::invalid(format!(
                "{} needs a field argument",
                agg.func.name()
            )));
        }
    }
    for group in &by {
        if let GroupSpec::Bin { width_ns, .. } = group {
            if *width_ns <= 0 {
                return Err(Error::invalid("bin needs a positive width"));
            }
        }
    }
    Ok(Stage::Stats { aggs, by })
}

/// Parse a duration literal: `250ms`, `30s`, `5m`, `2h`, `1d`, or a bare
/// nanosecond count.
pub fn parse_duration(text: &str) -> Result<i64> {
    fn parse_number(i: &str) -> IResult<&str, i64> {
        map_res(digit1, |s: &str| s.parse::<i64>())(i)
    }
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::invalid("empty duration"));
    }
    let (rest, n) = parse_number(text)
        .map_err(|_| Error::invalid(format!("bad duration '{}'", text)))?;
    let factor = match rest {
        "" => 1,
        "ns" => 1,
        "us" => 1_000,
        "ms" => time::NANOS_PER_MILLI,
        "s" => time::NANOS_PER_SEC,
        "m" => 60 * time::NANOS_PER_SEC,
        "h" => 3_600 * time::NANOS_PER_SEC,
        "d" => 86_400 * time::NANOS_PER_SEC,
        other => {
            return Err(Error::invalid(format!(
                "bad duration unit '{}' in '{}'",
                other, text
            )))
        }
    };
    n.checked_mul(factor)
        .ok_or_else(|| Error::invalid(format!("duration '{}' overflows", text)))
}

// ---- execution ----

/// Aggregation output: column names plus one row per group.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Timeseries output: a stats table whose first column `_time` holds the
/// bucket start timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub bucket_width: i64,
    pub table: StatsTable,
}

/// What a query ultimately produces.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Records {
        hits: Vec<Hit>,
        resume_token: Option<Vec<u8>>,
    },
    Table(StatsTable),
    TimeSeries(TimeSeries),
}

enum PipeData {
    Hits(Vec<Hit>),
    Table(StatsTable),
    TimeSeries(TimeSeries),
}

/// Run the pipeline over fully collected hits.
pub fn run_pipeline(
    hits: Vec<Hit>,
    stages: &[Stage],
    resume_token: Option<Vec<u8>>,
) -> Result<QueryOutput> {
    let mut data = PipeData::Hits(hits);
    for stage in stages {
        data = apply_stage(data, stage)?;
    }
    Ok(match data {
        PipeData::Hits(hits) => QueryOutput::Records {
            hits,
            resume_token,
        },
        PipeData::Table(table) => QueryOutput::Table(table),
        PipeData::TimeSeries(series) => QueryOutput::TimeSeries(series),
    })
}

/// Apply a streaming-safe stage to one hit (follow mode). Returns `None`
/// when the stage filters the hit out.
pub fn apply_streaming(stage: &Stage, mut hit: Hit) -> Option<Hit> {
    match stage {
        Stage::Where(expr) => {
            if expr.eval(&hit.rec).truthy() {
                Some(hit)
            } else {
                None
            }
        }
        Stage::Eval { name, expr } => {
            let value = expr.eval(&hit.rec);
            hit.rec.attrs.insert(name.clone(), value.render());
            Some(hit)
        }
        Stage::Fields(keep) => {
            hit.rec.attrs.retain(|k, _| keep.iter().any(|f| f == k));
            Some(hit)
        }
        Stage::Rename(pairs) => {
            for (from, to) in pairs {
                if let Some(value) = hit.rec.attrs.remove(from) {
                    hit.rec.attrs.insert(to.clone(), value);
                }
            }
            Some(hit)
        }
        // head is enforced by the follow loop itself; raw is a marker
        Stage::Head(_) | Stage::Raw => Some(hit),
        _ => Some(hit),
    }
}

fn apply_stage(data: PipeData, stage: &Stage) -> Result<PipeData> {
    match data {
        PipeData::Hits(mut hits) => match stage {
            Stage::Where(_) | Stage::Eval { .. } | Stage::Fields(_) | Stage::Rename(_) => {
                let hits = hits
                    .into_iter()
                    .filter_map(|hit| apply_streaming(stage, hit))
                    .collect();
                Ok(PipeData::Hits(hits))
            }
            Stage::SortBy { key, desc } => {
                hits.sort_by(|a, b| {
                    let va = sort_key(&a.rec, key);
                    let vb = sort_key(&b.rec, key);
                    let ord = va.compare(&vb);
                    if *desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                Ok(PipeData::Hits(hits))
            }
            Stage::Head(n) => {
                hits.truncate(*n);
                Ok(PipeData::Hits(hits))
            }
            Stage::Tail(n) => {
                let skip = hits.len().saturating_sub(*n);
                Ok(PipeData::Hits(hits.split_off(skip)))
            }
            Stage::Slice { offset, len } => {
                let hits = hits
                    .into_iter()
                    .skip(*offset)
                    .take(*len)
                    .collect();
                Ok(PipeData::Hits(hits))
            }
            Stage::Stats { aggs, by } => run_stats(&hits, aggs, by),
            Stage::Timechart { width_ns } => run_stats(
                &hits,
                &[AggSpec {
                    func: AggFunc::Count,
                    field: None,
                    alias: "count".to_owned(),
                }],
                &[GroupSpec::Bin {
                    field: "_write_ts".to_owned(),
                    width_ns: *width_ns,
                }],
            ),
            Stage::Raw => Ok(PipeData::Hits(hits)),
        },
        PipeData::Table(mut table) => match stage {
            // row-level windowing still applies after aggregation
            Stage::Head(n) => {
                table.rows.truncate(*n);
                Ok(PipeData::Table(table))
            }
            Stage::Tail(n) => {
                let skip = table.rows.len().saturating_sub(*n);
                table.rows = table.rows.split_off(skip);
                Ok(PipeData::Table(table))
            }
            Stage::Slice { offset, len } => {
                table.rows = table.rows.into_iter().skip(*offset).take(*len).collect();
                Ok(PipeData::Table(table))
            }
            other => Err(Error::invalid(format!(
                "'{}' cannot follow an aggregation stage",
                other.keyword()
            ))),
        },
        PipeData::TimeSeries(mut series) => match stage {
            Stage::Head(n) => {
                series.table.rows.truncate(*n);
                Ok(PipeData::TimeSeries(series))
            }
            Stage::Tail(n) => {
                let skip = series.table.rows.len().saturating_sub(*n);
                series.table.rows = series.table.rows.split_off(skip);
                Ok(PipeData::TimeSeries(series))
            }
            other => Err(Error::invalid(format!(
                "'{}' cannot follow an aggregation stage",
                other.keyword()
            ))),
        },
    }
}

fn sort_key(rec: &crate::store::Record, key: &str) -> Value {
    crate::query::Expr::Field(key.to_owned()).eval(rec)
}

struct AggState {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl AggState {
    fn new() -> AggState {
        AggState {
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
        }
    }

    fn feed(&mut self, value: Option<f64>) {
        match value {
            Some(v) => {
                self.count += 1;
                self.sum += v;
                self.min = Some(self.min.map(|m| m.min(v)).unwrap_or(v));
                self.max = Some(self.max.map(|m| m.max(v)).unwrap_or(v));
            }
            None => {}
        }
    }

    fn result(&self, func: AggFunc) -> Value {
        match func {
            AggFunc::Count => Value::Int(self.count as i64),
            AggFunc::Sum => Value::Float(self.sum),
            AggFunc::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Float(self.sum / self.count as f64)
                }
            }
            AggFunc::Min => self.min.map(Value::Float).unwrap_or(Value::Null),
            AggFunc::Max => self.max.map(Value::Float).unwrap_or(Value::Null),
        }
    }
}

fn run_stats(hits: &[Hit], aggs: &[AggSpec], by: &[GroupSpec]) -> Result<PipeData> {
    let bin_width = by.iter().find_map(|g| match g {
        GroupSpec::Bin { width_ns, .. } => Some(*width_ns),
        _ => None,
    });

    // group key -> per-agg state; BTreeMap keeps the output ordered by key
    let mut groups: BTreeMap<Vec<GroupKey>, Vec<AggState>> = BTreeMap::new();

    for hit in hits {
        let key: Vec<GroupKey> = by.iter().map(|g| group_key(&hit.rec, g)).collect();
        let states = groups
            .entry(key)
            .or_insert_with(|| aggs.iter().map(|_| AggState::new()).collect());
        for (agg, state) in aggs.iter().zip(states.iter_mut()) {
            match &agg.field {
                None => state.feed(Some(1.0)), // bare count
                Some(field) => {
                    state.feed(field_numeric(&hit.rec, field));
                }
            }
        }
    }

    let mut columns: Vec<String> = Vec::new();
    for group in by {
        columns.push(match group {
            GroupSpec::Field(f) => f.clone(),
            GroupSpec::Bin { .. } => "_time".to_owned(),
        });
    }
    for agg in aggs {
        columns.push(agg.alias.clone());
    }

    let mut rows = Vec::with_capacity(groups.len());
    for (key, states) in groups {
        let mut row: Vec<Value> = key.into_iter().map(GroupKey::into_value).collect();
        for (agg, state) in aggs.iter().zip(states.iter()) {
            row.push(state.result(agg.func));
        }
        rows.push(row);
    }

    let table = StatsTable { columns, rows };
    match bin_width {
        Some(width) => Ok(PipeData::TimeSeries(TimeSeries {
            bucket_width: width,
            table,
        })),
        None => Ok(PipeData::Table(table)),
    }
}

/// Orderable group key (f64 is not Ord, so bins use i64 bucket starts and
/// plain fields use their string rendering).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Bucket(i64),
    Text(String),
    Missing,
}

impl GroupKey {
    fn into_value(self) -> Value {
        match self {
            GroupKey::Bucket(start) => Value::Int(start),
            GroupKey::Text(text) => Value::Str(text),
            GroupKey::Missing => Value::Null,
        }
    }
}

fn group_key(rec: &crate::store::Record, group: &GroupSpec) -> GroupKey {
    match group {
        GroupSpec::Field(field) => match field_text(rec, field) {
            Some(text) => GroupKey::Text(text),
            None => GroupKey::Missing,
        },
        GroupSpec::Bin { field, width_ns } => {
            let value = match field.as_str() {
                "_write_ts" => Some(rec.write_ts),
                "_ingest_ts" => Some(rec.ingest_ts),
                "_source_ts" => Some(rec.source_ts),
                name => rec.attrs.get(name).and_then(|v| v.parse::<i64>().ok()),
            };
            match value {
                Some(v) => GroupKey::Bucket(time::floor_to(v, *width_ns)),
                None => GroupKey::Missing,
            }
        }
    }
}

fn field_text(rec: &crate::store::Record, field: &str) -> Option<String> {
    match field {
        "_raw" => Some(String::from_utf8_lossy(&rec.raw).into_owned()),
        "_write_ts" => Some(rec.write_ts.to_string()),
        "_ingest_ts" => Some(rec.ingest_ts.to_string()),
        "_source_ts" => Some(rec.source_ts.to_string()),
        name => rec.attrs.get(name).cloned(),
    }
}

fn field_numeric(rec: &crate::store::Record, field: &str) -> Option<f64> {
    match field {
        "_write_ts" => Some(rec.write_ts as f64),
        "_ingest_ts" => Some(rec.ingest_ts as f64),
        "_source_ts" => Some(rec.source_ts as f64),
        name => rec.attrs.get(name).and_then(|v| v.parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Record, RecordRef, VaultId};
    use crate::store::ChunkId;

    fn hit(write_ts: i64, raw: &str, attrs: &[(&str, &str)]) -> Hit {
        let mut rec = Record::new(raw.as_bytes().to_vec());
        rec.write_ts = write_ts;
        for (k, v) in attrs {
            rec.attrs.insert((*k).to_owned(), (*v).to_owned());
        }
        Hit {
            rec,
            at: RecordRef {
                vault_id: VaultId::nil(),
                chunk_id: ChunkId::from_parts(0, 0),
                position: 0,
            },
        }
    }

    fn records(output: QueryOutput) -> Vec<Hit> {
        match output {
            QueryOutput::Records { hits, .. } => hits,
            other => panic!("expected records, got {:?}", other),
        }
    }

    #[test]
    fn stage_parsing() {
        assert!(matches!(Stage::parse("head 10").unwrap(), Stage::Head(10)));
        assert!(matches!(Stage::parse("raw").unwrap(), Stage::Raw));
        assert!(matches!(
            Stage::parse("sort by latency desc").unwrap(),
            Stage::SortBy { desc: true, .. }
        ));
        assert!(matches!(
            Stage::parse("slice 5,10").unwrap(),
            Stage::Slice { offset: 5, len: 10 }
        ));
        assert!(Stage::parse("nonsense 1").is_err());
        assert!(Stage::parse("head many").is_err());
    }

    #[test]
    fn stats_parsing() {
        match Stage::parse("stats count, avg(latency) by host").unwrap() {
            Stage::Stats { aggs, by } => {
                assert_eq!(aggs.len(), 2);
                assert_eq!(aggs[0].func, AggFunc::Count);
                assert_eq!(aggs[0].alias, "count");
                assert_eq!(aggs[1].func, AggFunc::Avg);
                assert_eq!(aggs[1].alias, "avg_latency");
                assert_eq!(by, vec![GroupSpec::Field("host".into())]);
            }
            other => panic!("unexpected {:?}", other),
        }

        match Stage::parse("stats count by bin(_write_ts, 1m)").unwrap() {
            Stage::Stats { by, .. } => {
                assert_eq!(
                    by,
                    vec![GroupSpec::Bin {
                        field: "_write_ts".into(),
                        width_ns: 60 * time::NANOS_PER_SEC,
                    }]
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(Stage::parse("stats sum").is_err());
        assert!(Stage::parse("stats count by bin(x, 0s)").is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), 250 * time::NANOS_PER_MILLI);
        assert_eq!(parse_duration("1m").unwrap(), 60 * time::NANOS_PER_SEC);
        assert_eq!(parse_duration("500").unwrap(), 500);
        assert!(parse_duration("5 parsecs").is_err());
    }

    #[test]
    fn where_eval_fields() {
        let hits = vec![
            hit(1, "a", &[("latency", "100")]),
            hit(2, "b", &[("latency", "300")]),
        ];
        let stages = vec![
            Stage::parse("where latency > 200").unwrap(),
            Stage::parse("eval doubled = tonumber(latency) * 2").unwrap(),
        ];
        let out = records(run_pipeline(hits, &stages, None).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rec.attrs["doubled"], "600");
    }

    #[test]
    fn sort_head_tail() {
        let hits = vec![
            hit(1, "a", &[("n", "3")]),
            hit(2, "b", &[("n", "1")]),
            hit(3, "c", &[("n", "2")]),
        ];
        let stages = vec![Stage::parse("sort by n").unwrap()];
        let out = records(run_pipeline(hits.clone(), &stages, None).unwrap());
        let ns: Vec<_> = out.iter().map(|h| h.rec.attrs["n"].clone()).collect();
        assert_eq!(ns, vec!["1", "2", "3"]);

        let stages = vec![Stage::parse("tail 2").unwrap()];
        let out = records(run_pipeline(hits, &stages, None).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].rec.write_ts, 2);
    }

    #[test]
    fn stats_grouping() {
        let hits = vec![
            hit(1, "a", &[("host", "web1"), ("latency", "100")]),
            hit(2, "b", &[("host", "web1"), ("latency", "300")]),
            hit(3, "c", &[("host", "web2"), ("latency", "50")]),
        ];
        let stages = vec![Stage::parse("stats count, avg(latency) by host").unwrap()];
        match run_pipeline(hits, &stages, None).unwrap() {
            QueryOutput::Table(table) => {
                assert_eq!(table.columns, vec!["host", "count", "avg_latency"]);
                assert_eq!(table.rows.len(), 2);
                assert_eq!(table.rows[0][0], Value::Str("web1".into()));
                assert_eq!(table.rows[0][1], Value::Int(2));
                assert_eq!(table.rows[0][2], Value::Float(200.0));
                assert_eq!(table.rows[1][0], Value::Str("web2".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn timechart_buckets() {
        let w = time::NANOS_PER_SEC;
        let hits = vec![
            hit(0, "a", &[]),
            hit(w / 2, "b", &[]),
            hit(w + 1, "c", &[]),
        ];
        let stages = vec![Stage::parse("timechart 1s").unwrap()];
        match run_pipeline(hits, &stages, None).unwrap() {
            QueryOutput::TimeSeries(series) => {
                assert_eq!(series.bucket_width, w);
                assert_eq!(series.table.columns, vec!["_time", "count"]);
                assert_eq!(series.table.rows.len(), 2);
                assert_eq!(series.table.rows[0], vec![Value::Int(0), Value::Int(2)]);
                assert_eq!(series.table.rows[1], vec![Value::Int(w), Value::Int(1)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stages_after_stats_are_limited() {
        let hits = vec![hit(1, "a", &[("host", "x")])];
        let stages = vec![
            Stage::parse("stats count by host").unwrap(),
            Stage::parse("head 1").unwrap(),
        ];
        assert!(run_pipeline(hits.clone(), &stages, None).is_ok());

        let stages = vec![
            Stage::parse("stats count by host").unwrap(),
            Stage::parse("where count > 0").unwrap(),
        ];
        assert!(run_pipeline(hits, &stages, None).is_err());
    }
}
