//! End-to-end tests of node runtimes sharing one store and broker

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{cluster_config, http_job};
use crawlmesh::cluster::{BrokerDispatcher, NodeLoad};
use crawlmesh::config::Config;
use crawlmesh::queue::Job;
use crawlmesh::runtime::{Backends, NodeRuntime, StaticLoad};

fn config(id: &str) -> Config {
    let mut config = Config::default();
    config.node.id = id.to_string();
    config.node.load_report_interval_ms = 2_000;
    config.coordination.cluster = cluster_config("e2e");
    config
}

async fn start(id: &str, backends: &Backends, cpu: f64) -> NodeRuntime {
    let config = config(id);
    let dispatcher = Arc::new(BrokerDispatcher::new(
        Arc::clone(&backends.broker),
        &config.queue,
    ));
    NodeRuntime::start_with_probe(
        config,
        Arc::clone(&backends.store),
        Arc::clone(&backends.broker),
        dispatcher,
        Arc::new(StaticLoad(NodeLoad::new(cpu, cpu, 0))),
    )
    .await
    .unwrap()
}

/// Poll the node's inbox until a job shows up or `timeout` passes
async fn wait_for_assignment(runtime: &NodeRuntime, timeout: Duration) -> Option<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let mut jobs = runtime
            .take_assignments(1, Duration::from_millis(500))
            .await
            .unwrap();
        if let Some(job) = jobs.pop() {
            return Some(job);
        }
    }
    None
}

#[tokio::test(start_paused = true)]
async fn test_job_of_crashed_node_is_reassigned() {
    let backends = Backends::memory();

    // alpha starts first and leads; beta is idle and wins assignments
    let alpha = start("alpha", &backends, 0.9).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alpha.is_leader());
    let beta = start("beta", &backends, 0.1).await;

    alpha.submit(http_job("page-1", 6)).await.unwrap();

    let taken = wait_for_assignment(&beta, Duration::from_secs(10))
        .await
        .expect("beta never received its assignment");
    assert_eq!(taken.id, "page-1");
    assert_eq!(taken.assigned_to.as_deref(), Some("beta"));
    assert_eq!(taken.retry, 0);

    // beta dies without finishing or leaving; its lease runs out
    beta.shutdown().await;

    let recovered = wait_for_assignment(&alpha, Duration::from_secs(120))
        .await
        .expect("job was not recovered from the failed node");
    assert_eq!(recovered.id, "page-1");
    assert_eq!(recovered.assigned_to.as_deref(), Some("alpha"));
    assert_eq!(recovered.retry, 1);

    let record = alpha
        .scheduler()
        .ledger()
        .get("page-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.node_id, "alpha");

    assert!(alpha.complete_job("page-1").await.unwrap());
    assert!(alpha.scheduler().ledger().all().await.unwrap().is_empty());

    alpha.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_leader_leave_hands_over_scheduling() {
    let backends = Backends::memory();

    let alpha = start("alpha", &backends, 0.5).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let beta = start("beta", &backends, 0.5).await;
    assert!(alpha.is_leader());
    assert!(!beta.is_leader());

    alpha.leave().await.unwrap();

    // the lock is not released on leave; beta takes over once it expires
    let mut waited = Duration::ZERO;
    while !beta.is_leader() && waited < Duration::from_secs(60) {
        tokio::time::sleep(Duration::from_millis(500)).await;
        waited += Duration::from_millis(500);
    }
    assert!(beta.is_leader());
    assert!(waited <= Duration::from_secs(25));

    beta.submit(http_job("page-2", 3)).await.unwrap();
    let taken = wait_for_assignment(&beta, Duration::from_secs(10))
        .await
        .expect("new leader did not schedule");
    assert_eq!(taken.id, "page-2");

    beta.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_drained_node_gets_no_new_work() {
    let backends = Backends::memory();

    let alpha = start("alpha", &backends, 0.8).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let beta = start("beta", &backends, 0.1).await;

    beta.drain().await.unwrap();
    alpha.submit(http_job("page-3", 5)).await.unwrap();

    let taken = wait_for_assignment(&alpha, Duration::from_secs(10))
        .await
        .expect("job not scheduled on the active node");
    assert_eq!(taken.id, "page-3");
    assert!(beta
        .take_assignments(10, Duration::ZERO)
        .await
        .unwrap()
        .is_empty());

    alpha.shutdown().await;
    beta.shutdown().await;
}
