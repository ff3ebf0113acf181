// Concurrency behavior: single engine construction, bounded async pool,
// and engine swaps under in-flight queries

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metricflowd::{
    ApiError, Engine, EngineFactory, EngineProvider, EnvironmentConfig, EnvironmentRegistry,
    GroupByInput, MetricInput, QueryStatus, SemanticManifest, ServiceConfig, ServiceContext,
};
use pretty_assertions::assert_eq;
use support::{test_context, StaticSqlClient, MANIFEST_JSON};
use tempfile::TempDir;

struct SlowCountingFactory {
    builds: AtomicUsize,
}

impl EngineFactory for SlowCountingFactory {
    fn build(&self, _env: &EnvironmentConfig) -> Result<Arc<Engine>, ApiError> {
        // lengthen the construction window so racing readers pile up
        std::thread::sleep(Duration::from_millis(50));
        self.builds.fetch_add(1, Ordering::SeqCst);
        let manifest = SemanticManifest::from_json(MANIFEST_JSON).unwrap();
        Ok(Arc::new(Engine::new(
            manifest,
            Arc::new(StaticSqlClient::default()),
        )))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_reads_construct_the_engine_once() {
    let dir = TempDir::new().unwrap();
    let config_path = support::write_environments(dir.path(), "p1");
    let registry = Arc::new(EnvironmentRegistry::load(&config_path).unwrap());
    let factory = Arc::new(SlowCountingFactory {
        builds: AtomicUsize::new(0),
    });
    let provider = Arc::new(EngineProvider::new(registry, factory.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provider = provider.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            provider.get_engine("p1").unwrap()
        }));
    }
    let engines: Vec<Arc<Engine>> = futures_join(handles).await;
    assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
    for engine in &engines[1..] {
        assert!(Arc::ptr_eq(&engines[0], engine));
    }
}

async fn futures_join(handles: Vec<tokio::task::JoinHandle<Arc<Engine>>>) -> Vec<Arc<Engine>> {
    let mut engines = Vec::new();
    for handle in handles {
        engines.push(handle.await.unwrap());
    }
    engines
}

fn revenue_inputs() -> (Vec<MetricInput>, Vec<GroupByInput>) {
    (
        vec![MetricInput {
            name: "revenue".to_string(),
        }],
        vec![GroupByInput {
            name: "region".to_string(),
            grain: None,
        }],
    )
}

async fn wait_all_terminal(context: &ServiceContext, query_ids: &[String]) {
    for query_id in query_ids {
        for attempt in 0..200 {
            let result = context
                .query_service
                .get_query_result("p1", query_id)
                .unwrap();
            if result.status.is_terminal() {
                assert_eq!(result.status, QueryStatus::Successful, "query {query_id}");
                break;
            }
            assert!(attempt < 199, "query {query_id} never finished");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounded_pool_drains_a_burst_of_async_queries() {
    let dir = TempDir::new().unwrap();
    let client = StaticSqlClient {
        delay: Some(Duration::from_millis(50)),
        ..StaticSqlClient::default()
    };
    let mut config = ServiceConfig::default();
    config.query_async_workers = 2;
    let context = test_context(dir.path(), Arc::new(client), config);
    let (metrics, group_by) = revenue_inputs();

    let mut query_ids = Vec::new();
    for _ in 0..6 {
        let query_id = context
            .query_service
            .create_query("p1", &metrics, &group_by, None, &[], None, true)
            .await
            .unwrap();
        query_ids.push(query_id);
    }
    wait_all_terminal(&context, &query_ids).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_query_survives_an_engine_swap() {
    let dir = TempDir::new().unwrap();
    let client = StaticSqlClient {
        delay: Some(Duration::from_millis(300)),
        ..StaticSqlClient::default()
    };
    let context = test_context(dir.path(), Arc::new(client), ServiceConfig::default());
    let (metrics, group_by) = revenue_inputs();

    let query_id = context
        .query_service
        .create_query("p1", &metrics, &group_by, None, &[], None, true)
        .await
        .unwrap();

    // swap the engine while the query is (very likely) mid-execution
    tokio::time::sleep(Duration::from_millis(50)).await;
    let old = context.engine_provider.get_engine("p1").unwrap();
    let new = context.engine_provider.rebuild_engine("p1", true).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));

    wait_all_terminal(&context, std::slice::from_ref(&query_id)).await;
}
