use colony_core::{AgentConfig, AgentId, WorkerId};
use colony_env::SimulationConfig;
use colony_mesh::{AgentTypeRegistry, HandlerTable};
use colony_node::{MasterConfig, MasterNode, NodeError, RetryPolicy, WorkerConfig, WorkerNode};
use std::sync::Arc;
use std::time::Duration;

async fn start_master() -> (MasterNode, String) {
    let master = MasterNode::builder(
        MasterConfig::default().with_port(0),
        SimulationConfig::default(),
    )
    .build()
    .unwrap();
    let listener = master.bind().await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    master.spawn(listener);
    (master, url)
}

fn worker(id: &str, master_url: &str, attempts: u32) -> WorkerNode {
    let types = AgentTypeRegistry::new().register("idle", |_config| Ok(HandlerTable::default()));
    let config = WorkerConfig::new(WorkerId::parse(id).unwrap(), master_url)
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_retry(RetryPolicy {
            max_attempts: attempts,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            multiplier: 2,
        });
    WorkerNode::new(config, Arc::new(types)).unwrap()
}

async fn start_worker(id: &str, master_url: &str) -> WorkerNode {
    let node = worker(id, master_url, 3);
    let listener = node.bind().await.unwrap();
    node.spawn(listener);
    node
}

#[tokio::test]
async fn test_forgotten_worker_reregisters_on_heartbeat() {
    let (master, url) = start_master().await;
    let w1 = start_worker("w1", &url).await;
    master
        .wait_for_workers(1, Duration::from_secs(5))
        .await
        .unwrap();

    master.registry().remove(w1.worker_id());
    assert_eq!(master.registry().len(), 0);

    master
        .wait_for_workers(1, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(master.registry().get(w1.worker_id()).is_some());

    master.shutdown("test over").await;
}

#[tokio::test]
async fn test_duplicate_worker_id_is_rejected() {
    let (master, url) = start_master().await;
    let _w1 = start_worker("w1", &url).await;
    master
        .wait_for_workers(1, Duration::from_secs(5))
        .await
        .unwrap();

    let impostor = worker("w1", &url, 1);
    let listener = impostor.bind().await.unwrap();
    let err = impostor.serve(listener).await.unwrap_err();
    match err {
        NodeError::RegistrationExhausted { last_error, .. } => {
            assert!(last_error.contains("duplicate_worker"), "{last_error}")
        }
        other => panic!("unexpected error: {other}"),
    }
    master.shutdown("test over").await;
}

#[tokio::test]
async fn test_allocation_records_locations_and_rejects_duplicates() {
    let (master, url) = start_master().await;
    let w1 = start_worker("w1", &url).await;
    let w2 = start_worker("w2", &url).await;
    master
        .wait_for_workers(2, Duration::from_secs(5))
        .await
        .unwrap();

    let configs: Vec<AgentConfig> = (1..=4)
        .map(|i| AgentConfig::new(AgentId::parse(format!("a{i}")).unwrap(), "idle"))
        .collect();
    let report = master.allocate(configs).await.unwrap();
    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(report.allocated.len(), 4);
    assert_eq!(master.directory().count_on(w1.worker_id()), 2);
    assert_eq!(master.directory().count_on(w2.worker_id()), 2);
    assert_eq!(w1.host().len() + w2.host().len(), 4);

    let again = vec![
        AgentConfig::new(AgentId::parse("a1").unwrap(), "idle"),
        AgentConfig::new(AgentId::parse("b1").unwrap(), "unknown-type"),
    ];
    let report = master.allocate(again).await.unwrap();
    assert!(report.allocated.is_empty());
    assert_eq!(report.failures.len(), 2);

    master.shutdown("test over").await;
}
