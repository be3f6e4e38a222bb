//! Persistence Integration Tests
//!
//! The SQLite store shared by separate handles, and the JSONL ledger under
//! concurrent writers.

use std::sync::Arc;
use std::time::Duration;

use agentkit::core::{AuditLedger, Auditor, Outcome, RetryPolicy, Routing, Worker, WorkerConfig};
use agentkit::domain::{LedgerEntry, ResultStatus, TaskId, TaskKind, TaskResult};
use agentkit::handlers::{ContentDistributor, HandlerSet};
use agentkit::ingest::{MemorySource, Producer};
use agentkit::market::{Marketplace, StartPosition};
use tempfile::TempDir;

fn worker(market: &Marketplace, name: &str) -> Worker {
    Worker::new(
        market.clone(),
        HandlerSet::builtin(ContentDistributor::default()).unwrap(),
        WorkerConfig {
            name: name.to_string(),
            claim_timeout: Duration::ZERO,
            retry: RetryPolicy::immediate(3),
            routing: Routing::Topic,
        },
    )
}

#[tokio::test]
async fn test_roles_share_sqlite_store() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("market.db");

    // Poller, worker and auditor each with their own handle, as separate processes would.
    let poller_market = Marketplace::sqlite(&db).unwrap();
    let worker_market = Marketplace::sqlite(&db).unwrap();
    let auditor_market = Marketplace::sqlite(&db).unwrap();

    let source = Arc::new(MemorySource::new());
    source.push_line("SCAN_SITE domain=example.com").await;
    source.push_line("PUBLISH_REPORT client=acme dataset=q3 format=pdf").await;
    let mut producer = Producer::new(source, poller_market.clone(), Duration::from_secs(5));
    assert_eq!(producer.poll_once().await.unwrap().enqueued, 2);

    let w = worker(&worker_market, "worker-sql");
    for _ in 0..2 {
        let outcome = w.run_once(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Completed(ref r) if r.is_success()));
    }
    assert!(w.run_once(Duration::ZERO).await.unwrap().is_none());

    // Results published before the auditor started are still in the log.
    let ledger = AuditLedger::new(temp.path().join("ledger.jsonl"));
    let mut auditor =
        Auditor::attach(&auditor_market, ledger, "AuditorAgent", StartPosition::Beginning)
            .await
            .unwrap();
    let first = auditor.record_next().await.unwrap().unwrap();
    let second = auditor.record_next().await.unwrap().unwrap();
    assert_eq!(first.job_id, TaskId::from_raw("SCAN_SITE domain=example.com"));
    assert_eq!(
        second.job_id,
        TaskId::from_raw("PUBLISH_REPORT client=acme dataset=q3 format=pdf")
    );

    let counts = poller_market.queue.counts().await.unwrap();
    assert_eq!(counts.done, 2);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn test_kill_switch_persists_across_reopen() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("market.db");

    {
        let market = Marketplace::sqlite(&db).unwrap();
        market.kill_switch.engage().await.unwrap();
    }

    let market = Marketplace::sqlite(&db).unwrap();
    assert!(market.kill_switch.is_engaged().await.unwrap());

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let stats = worker(&market, "worker-late").run(rx).await.unwrap();
    assert_eq!(stats.succeeded + stats.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_handles_claim_each_task_once_in_push_order() {
    const TASKS: usize = 12;
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("market.db");
    let market = Marketplace::sqlite(&db).unwrap();

    let source = Arc::new(MemorySource::new());
    for i in 0..TASKS {
        source.push_line(&format!("SCAN_SITE domain=site{i}.com")).await;
    }
    let mut producer = Producer::new(source, market.clone(), Duration::from_secs(5));
    assert_eq!(producer.poll_once().await.unwrap().enqueued, TASKS);

    let mut handles = Vec::new();
    for i in 0..3 {
        let market = Marketplace::sqlite(&db).unwrap();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = market
                .queue
                .claim(&[TaskKind::ScanSite], Duration::ZERO)
                .await
                .unwrap()
            {
                let index = push_index(&task.params["domain"]);
                // Every older task has already left PENDING.
                let pending = market.queue.counts().await.unwrap().pending;
                assert!(
                    pending < TASKS - index,
                    "claimed #{index} with {pending} tasks still pending"
                );
                claimed.push((index, task.id.clone()));

                let name = format!("w{i}");
                let result = TaskResult::success(task.id.clone(), Default::default(), &name);
                let mut task = task;
                task.complete(1).unwrap();
                market.queue.finish(&task).await.unwrap();
                market.results.publish(&result).await.unwrap();
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        let claimed = handle.await.unwrap();
        assert!(
            claimed.windows(2).all(|pair| pair[0].0 < pair[1].0),
            "one handle saw tasks out of push order: {claimed:?}"
        );
        all.extend(claimed);
    }
    all.sort();
    let indexes: Vec<usize> = all.iter().map(|(index, _)| *index).collect();
    assert_eq!(indexes, (0..TASKS).collect::<Vec<_>>());
    assert_eq!(market.queue.counts().await.unwrap().done, TASKS);
}

fn push_index(domain: &str) -> usize {
    domain
        .strip_prefix("site")
        .and_then(|rest| rest.strip_suffix(".com"))
        .and_then(|n| n.parse().ok())
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ledger_appends_stay_line_delimited() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("audit").join("ledger.jsonl");

    let mut writers = Vec::new();
    for w in 0..4 {
        let ledger = AuditLedger::new(&path);
        writers.push(tokio::spawn(async move {
            for i in 0..25 {
                let result = TaskResult::failed(
                    TaskId::from(format!("job-{w}-{i}")),
                    &"x".repeat(2048),
                    3,
                    &format!("worker-{w}"),
                );
                ledger
                    .append(&LedgerEntry::for_result(&result, "AuditorAgent"))
                    .await
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 100);
    for line in raw.lines() {
        let entry: LedgerEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.result, ResultStatus::Failed);
    }
    assert_eq!(AuditLedger::new(&path).entries().await.unwrap().len(), 100);
}
