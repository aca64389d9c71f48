//! End-to-end scenarios: rotation, index-backed search, resumable
//! pagination, the histogram fast path, follow mode and migration.

use std::sync::Arc;

use anyhow::Result;

use logkeep::config::{RotationPolicyConfig, VaultConfig, VaultType};
use logkeep::orchestrator::{Orchestrator, OrchestratorOptions};
use logkeep::query::{FollowOptions, Query, QueryEngine, SearchOptions};
use logkeep::scheduler::JobState;
use logkeep::store::{Record, RotationPolicy, VaultId};
use logkeep::tools::time::NANOS_PER_SEC;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct TestEngine {
    orch: Arc<Orchestrator>,
    engine: QueryEngine,
    _dir: tempfile::TempDir,
}

fn setup() -> Result<TestEngine> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let mut options = OrchestratorOptions::new(dir.path().join("data"));
    // a single worker keeps queue order and append order identical,
    // which the ordering assertions below rely on
    options.ingest_workers = 1;
    let orch = Orchestrator::new(options)?;
    let engine = QueryEngine::new(orch.clone());
    Ok(TestEngine {
        orch,
        engine,
        _dir: dir,
    })
}

fn add_vault(
    t: &TestEngine,
    name: &str,
    vault_type: VaultType,
    max_records: Option<u64>,
) -> Result<VaultId> {
    let mut cfg = VaultConfig::new(name, vault_type);
    if let Some(max) = max_records {
        let policy = RotationPolicyConfig::new(
            format!("{}-rotation", name),
            RotationPolicy::new().max_records(Some(max)),
        );
        let policy_id = policy.id;
        t.orch.set_rotation_policy(policy)?;
        cfg = cfg.rotation_policy(policy_id);
    }
    Ok(t.orch.add_vault(cfg)?)
}

fn ingest_lines(t: &TestEngine, lines: &[String]) -> Result<()> {
    for line in lines {
        t.orch.ingest(Record::new(line.clone().into_bytes()))?;
    }
    t.orch.flush();
    Ok(())
}

fn wait_for_jobs(t: &TestEngine) {
    for job in t.orch.scheduler().jobs() {
        job.wait();
    }
}

fn raw_strings(hits: &[logkeep::query::Hit]) -> Vec<String> {
    hits.iter()
        .map(|h| String::from_utf8_lossy(&h.rec.raw).into_owned())
        .collect()
}

fn search_all(t: &TestEngine, query_text: &str) -> Result<Vec<logkeep::query::Hit>> {
    let query = Query::parse(query_text)?;
    let mut stream = t.engine.search(&query, &SearchOptions::default())?;
    Ok(stream.collect_hits()?)
}

#[test]
fn rotation_produces_sealed_chunks_and_order_is_preserved() -> Result<()> {
    let t = setup()?;
    let vault = add_vault(&t, "rotating", VaultType::File, Some(5))?;

    let lines: Vec<String> = (1..=12).map(|i| format!("m{}", i)).collect();
    ingest_lines(&t, &lines)?;

    let chunks = t.orch.vault(vault)?.chunk_manager().list();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].record_count, 5);
    assert!(chunks[0].sealed);
    assert_eq!(chunks[1].record_count, 5);
    assert!(chunks[1].sealed);
    assert_eq!(chunks[2].record_count, 2);
    assert!(!chunks[2].sealed);

    // newest-first: m12 .. m1
    let hits = search_all(&t, "*")?;
    let expected: Vec<String> = (1..=12).rev().map(|i| format!("m{}", i)).collect();
    assert_eq!(raw_strings(&hits), expected);
    Ok(())
}

#[test]
fn token_search_via_indexes() -> Result<()> {
    let t = setup()?;
    let vault = add_vault(&t, "tokens", VaultType::File, None)?;

    ingest_lines(
        &t,
        &[
            "user login ok".to_owned(),
            "user logout ok".to_owned(),
            "error network".to_owned(),
        ],
    )?;

    // seal and index the chunk
    t.orch.disable_vault(vault)?;
    wait_for_jobs(&t);
    let handle = t.orch.vault(vault)?;
    let sealed = handle.chunk_manager().list()[0];
    assert!(handle.index_manager().indexes_complete(sealed.id));

    assert_eq!(
        raw_strings(&search_all(&t, "user")?),
        vec!["user logout ok", "user login ok"]
    );
    assert_eq!(
        raw_strings(&search_all(&t, "user AND ok")?),
        vec!["user logout ok", "user login ok"]
    );
    assert_eq!(
        raw_strings(&search_all(&t, "error OR login")?),
        vec!["error network", "user login ok"]
    );
    assert!(search_all(&t, "foo")?.is_empty());

    // the plan actually used the indexes
    let report = t.engine.explain(&Query::parse("user")?)?;
    let steps = &report.vaults[0].steps;
    assert!(steps
        .iter()
        .any(|s| matches!(s.action, logkeep::query::PlanAction::Indexed)));
    Ok(())
}

#[test]
fn resume_tokens_paginate_without_gaps_or_overlap() -> Result<()> {
    let t = setup()?;
    add_vault(&t, "paged", VaultType::File, Some(17))?;

    let lines: Vec<String> = (0..100).map(|i| format!("record {:03}", i)).collect();
    ingest_lines(&t, &lines)?;

    let full = raw_strings(&search_all(&t, "*")?);
    assert_eq!(full.len(), 100);

    let mut collected: Vec<String> = Vec::new();
    let mut token: Option<Vec<u8>> = None;
    let mut calls = 0;
    loop {
        let query = Query::parse("*")?.with_limit(30);
        let opts = SearchOptions {
            resume_token: token.take(),
            ..SearchOptions::default()
        };
        let mut stream = t.engine.search(&query, &opts)?;
        let hits = stream.collect_hits()?;
        calls += 1;
        let batch = raw_strings(&hits);
        match calls {
            1..=3 => assert_eq!(batch.len(), 30),
            4 => assert_eq!(batch.len(), 10),
            _ => panic!("too many pages"),
        }
        collected.extend(batch);
        match stream.resume_token() {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    assert_eq!(calls, 4);
    assert_eq!(collected, full);
    Ok(())
}

#[test]
fn histogram_fast_path_reads_no_record_bodies() -> Result<()> {
    let t = setup()?;
    let vault = add_vault(&t, "histo", VaultType::File, Some(200))?;

    let t0 = 1_700_000_000 * NANOS_PER_SEC;
    let records: Vec<Record> = (0..1000)
        .map(|i| {
            let mut rec = Record::new(format!("event {}", i).into_bytes());
            rec.ingest_ts = t0 + i * NANOS_PER_SEC;
            rec.write_ts = t0 + i * NANOS_PER_SEC;
            rec
        })
        .collect();
    t.orch.import_records(vault, records, true)?;

    let handle = t.orch.vault(vault)?;
    let filled = handle
        .chunk_manager()
        .list()
        .iter()
        .filter(|m| m.record_count > 0)
        .count();
    assert_eq!(filled, 5);

    // let the index builds finish, then snapshot the body-read counters
    wait_for_jobs(&t);
    let reads_before: u64 = handle
        .chunk_manager()
        .chunks()
        .iter()
        .map(|c| c.io_stats().body_reads)
        .sum();

    let query = Query::all().between(Some(t0), Some(t0 + 1000 * NANOS_PER_SEC));
    let histogram = t.engine.histogram(&query, 10)?;
    assert_eq!(histogram.counts, vec![100; 10]);
    assert!(!histogram.truncated);

    let reads_after: u64 = handle
        .chunk_manager()
        .chunks()
        .iter()
        .map(|c| c.io_stats().body_reads)
        .sum();
    assert_eq!(reads_before, reads_after, "fast path must not read bodies");

    // filtered histograms still work, via the scan path
    let mut filtered = Query::parse("event")?;
    filtered = filtered.between(Some(t0), Some(t0 + 1000 * NANOS_PER_SEC));
    let histogram = t.engine.histogram(&filtered, 10)?;
    assert_eq!(histogram.counts.iter().sum::<u64>(), 1000);
    Ok(())
}

#[test]
fn follow_emits_new_records_and_cancels_cleanly() -> Result<()> {
    let t = setup()?;
    add_vault(&t, "tailed", VaultType::Memory, None)?;

    let opts = FollowOptions::default();
    let cancel = opts.cancel.clone();
    let mut stream = t.engine.follow(&Query::parse("*")?, opts)?;

    let (tx, rx) = std::sync::mpsc::channel();
    let worker = std::thread::spawn(move || {
        while let Ok(Some(hit)) = stream.next() {
            if tx.send(hit).is_err() {
                break;
            }
        }
    });

    t.orch.ingest(Record::new(&b"tail me"[..]))?;
    t.orch.flush();

    let hit = rx.recv_timeout(std::time::Duration::from_secs(5))?;
    assert_eq!(&hit.rec.raw[..], b"tail me");

    cancel.cancel();
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("follow worker panicked"))?;
    Ok(())
}

#[test]
fn migration_between_file_vaults_preserves_write_ts() -> Result<()> {
    let t = setup()?;
    let src = add_vault(&t, "mig-src", VaultType::File, Some(4))?;

    let t0 = 1_600_000_000 * NANOS_PER_SEC;
    let records: Vec<Record> = (1..=10)
        .map(|i| {
            let mut rec = Record::new(format!("payload {}", i).into_bytes());
            rec.ingest_ts = t0 + i;
            rec.write_ts = t0 + i;
            rec
        })
        .collect();
    t.orch.import_records(src, records, true)?;
    let original_ts: Vec<i64> = search_all(&t, "*")?
        .iter()
        .map(|h| h.rec.write_ts)
        .collect();

    let dest_cfg = VaultConfig::new("mig-dest", VaultType::File);
    let job = t.orch.migrate_vault(src, dest_cfg)?;
    assert_eq!(job.wait(), JobState::Finished);

    // source is gone
    assert!(t.orch.vault(src).is_err());

    let dest = t.orch.vault_by_name("mig-dest")?;
    let (records_stored, _) = dest.chunk_manager().totals();
    assert_eq!(records_stored, 10);

    let migrated_ts: Vec<i64> = search_all(&t, "*")?
        .iter()
        .map(|h| h.rec.write_ts)
        .collect();
    assert_eq!(migrated_ts, original_ts);
    Ok(())
}

#[test]
fn export_import_roundtrip_preserves_payload_attrs_source_ts() -> Result<()> {
    let t = setup()?;
    let src = add_vault(&t, "exp-src", VaultType::Memory, None)?;
    let dst = add_vault(&t, "exp-dst", VaultType::Memory, None)?;

    for i in 0..20 {
        let rec = Record::new(format!("line {}", i).into_bytes())
            .attr("seq", i.to_string())
            .source_ts(1000 + i);
        t.orch.import_records(src, vec![rec], false)?;
    }

    let exported: Vec<Record> = t
        .orch
        .export_vault(src)?
        .collect::<logkeep::Result<Vec<_>>>()?;
    assert_eq!(exported.len(), 20);

    t.orch.import_records(dst, exported.clone(), false)?;
    let reimported: Vec<Record> = t
        .orch
        .export_vault(dst)?
        .collect::<logkeep::Result<Vec<_>>>()?;

    for (a, b) in exported.iter().zip(reimported.iter()) {
        assert_eq!(a.raw, b.raw);
        assert_eq!(a.attrs, b.attrs);
        assert_eq!(a.source_ts, b.source_ts);
    }
    Ok(())
}

#[test]
fn boundary_behaviors() -> Result<()> {
    let t = setup()?;
    let vault = add_vault(&t, "edges", VaultType::Memory, None)?;

    // empty vault: no records, no error
    assert!(search_all(&t, "*")?.is_empty());

    ingest_lines(&t, &["alpha".into(), "beta".into()])?;

    // start == end yields nothing
    let hits = search_all(&t, "*")?;
    let ts = hits[0].rec.write_ts;
    let query = Query::all().between(Some(ts), Some(ts));
    let mut stream = t.engine.search(&query, &SearchOptions::default())?;
    assert!(stream.collect_hits()?.is_empty());

    // histogram over an empty range has zero buckets
    let histogram = t.engine.histogram(&Query::all().between(Some(ts), Some(ts)), 10)?;
    assert!(histogram.counts.is_empty());

    // context of (ref, 0, 0) is exactly the anchor
    let anchor = hits[1].at;
    let context = t.engine.get_context(&anchor, 0, 0)?;
    assert_eq!(context.len(), 1);
    assert_eq!(context[0].at, anchor);

    // remove refuses a non-empty vault, force-remove succeeds
    assert!(matches!(
        t.orch.remove_vault(vault),
        Err(logkeep::Error::FailedPrecondition(_))
    ));
    t.orch.force_remove_vault(vault)?;
    assert!(t.orch.vault(vault).is_err());
    Ok(())
}

#[test]
fn stats_pipeline_end_to_end() -> Result<()> {
    let t = setup()?;
    add_vault(&t, "stats", VaultType::Memory, None)?;

    ingest_lines(
        &t,
        &[
            "req done host=web1 latency=100".to_owned(),
            "req done host=web1 latency=300".to_owned(),
            "req done host=web2 latency=40".to_owned(),
        ],
    )?;

    let query = Query::parse("req | eval lat = len(_raw) | stats count")?;
    match t.engine.execute(&query, &SearchOptions::default())? {
        logkeep::query::QueryOutput::Table(table) => {
            assert_eq!(table.columns, vec!["count"]);
            assert_eq!(table.rows, vec![vec![logkeep::query::Value::Int(3)]]);
        }
        other => panic!("expected a table, got {:?}", other),
    }

    // timechart produces a timeseries
    let query = Query::parse("* | timechart 1h")?;
    match t.engine.execute(&query, &SearchOptions::default())? {
        logkeep::query::QueryOutput::TimeSeries(series) => {
            let total: i64 = series
                .table
                .rows
                .iter()
                .filter_map(|row| match row.get(1) {
                    Some(logkeep::query::Value::Int(n)) => Some(*n),
                    _ => None,
                })
                .sum();
            assert_eq!(total, 3);
        }
        other => panic!("expected a timeseries, got {:?}", other),
    }
    Ok(())
}

#[test]
fn filters_route_records_to_matching_vaults_only() -> Result<()> {
    let t = setup()?;

    let errors_filter = logkeep::config::FilterConfig::new("errors", "error OR fatal");
    let errors_filter_id = errors_filter.id;
    t.orch.set_filter(errors_filter)?;

    let all = add_vault(&t, "everything", VaultType::Memory, None)?;
    let errors = t.orch.add_vault(
        VaultConfig::new("errors-only", VaultType::Memory).filter(errors_filter_id),
    )?;

    ingest_lines(
        &t,
        &[
            "info all quiet".to_owned(),
            "error disk full".to_owned(),
            "fatal kernel panic".to_owned(),
        ],
    )?;

    let all_stats = t.orch.vault_stats(all)?;
    assert_eq!(all_stats.ingested_records, 3);
    assert_eq!(all_stats.stored_records, 3);

    let err_stats = t.orch.vault_stats(errors)?;
    assert_eq!(err_stats.ingested_records, 2);
    assert_eq!(err_stats.stored_records, 2);

    // scoping a query to one store only touches that vault
    let hits = search_all(&t, "store=errors-only error")?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].at.vault_id, errors);

    // a disabled vault stops receiving records
    t.orch.disable_vault(errors)?;
    ingest_lines(&t, &["error again".to_owned()])?;
    assert_eq!(t.orch.vault_stats(errors)?.stored_records, 2);
    assert_eq!(t.orch.vault_stats(all)?.stored_records, 4);

    // and picks back up once re-enabled
    t.orch.enable_vault(errors)?;
    ingest_lines(&t, &["fatal once more".to_owned()])?;
    assert_eq!(t.orch.vault_stats(errors)?.stored_records, 3);
    Ok(())
}

#[test]
fn merge_combines_vaults_in_write_order() -> Result<()> {
    let t = setup()?;
    let a = add_vault(&t, "merge-a", VaultType::Memory, None)?;
    let b = add_vault(&t, "merge-b", VaultType::Memory, None)?;

    let t0 = 1_650_000_000 * NANOS_PER_SEC;
    let stamped = |i: i64, text: &str| {
        let mut rec = Record::new(text.as_bytes().to_vec());
        rec.ingest_ts = t0 + i;
        rec.write_ts = t0 + i;
        rec
    };
    // interleaved timestamps across the two sources
    t.orch
        .import_records(a, vec![stamped(1, "a1"), stamped(3, "a3")], true)?;
    t.orch
        .import_records(b, vec![stamped(2, "b2"), stamped(4, "b4")], true)?;

    let job = t
        .orch
        .merge_vaults(vec![a, b], VaultConfig::new("merged", VaultType::Memory))?;
    assert_eq!(job.wait(), JobState::Finished);

    let merged = t.orch.vault_by_name("merged")?;
    let exported: Vec<Record> = t
        .orch
        .export_vault(merged.id())?
        .collect::<logkeep::Result<Vec<_>>>()?;
    let raws: Vec<&[u8]> = exported.iter().map(|r| &r.raw[..]).collect();
    assert_eq!(raws, vec![&b"a1"[..], &b"b2"[..], &b"a3"[..], &b"b4"[..]]);

    // sources are untouched
    assert_eq!(t.orch.vault_stats(a)?.stored_records, 2);
    assert_eq!(t.orch.vault_stats(b)?.stored_records, 2);
    Ok(())
}

#[test]
fn validation_and_analysis_are_clean_on_healthy_vaults() -> Result<()> {
    let t = setup()?;
    let vault = add_vault(&t, "healthy", VaultType::File, Some(3))?;
    ingest_lines(&t, &(0..10).map(|i| format!("entry {}", i)).collect::<Vec<_>>())?;
    wait_for_jobs(&t);

    let report = t.orch.validate_vault(vault)?;
    assert!(report.is_clean(), "findings: {:?}", report.findings);
    assert_eq!(report.records_checked, 10);

    let handle = t.orch.vault(vault)?;
    let sealed = handle.chunk_manager().list()[0];
    let analysis = t.orch.analyze_chunk(vault, sealed.id)?;
    assert_eq!(analysis.meta.record_count, 3);
    assert_eq!(analysis.index_states.len(), 7);
    assert!(analysis
        .index_states
        .values()
        .all(|s| *s == logkeep::index::IndexState::Complete));
    Ok(())
}
