//! 调度器、队列与工作者的协同测试

use async_trait::async_trait;
use relay_vitals::error::ProbeError;
use relay_vitals::logging::{LogConfig, LoggingSystem};
use relay_vitals::probe::{InfoPageProber, ReachabilityProber};
use relay_vitals::queue::{InMemoryWorkQueue, RetryPolicy, WorkQueue};
use relay_vitals::scheduler::{RescanScheduler, Scheduler};
use relay_vitals::store::{InMemoryStatusStore, StatusStore};
use relay_vitals::worker::{CheckPipeline, PipelineOptions, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

struct AlwaysUp;

#[async_trait]
impl ReachabilityProber for AlwaysUp {
    async fn test_endpoint(&self, _uri: &str) -> Result<bool, ProbeError> {
        Ok(true)
    }
}

struct NoInfoPage;

#[async_trait]
impl InfoPageProber for NoInfoPage {
    async fn has_info_page(&self, _domain: &str) -> bool {
        false
    }
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("条件未在预期时间内满足");
}

#[tokio::test]
async fn test_rescan_and_registration_flow_through_workers() {
    let store = Arc::new(InMemoryStatusStore::new());
    for uri in [
        "smp://a@one.example.com",
        "smp://b@two.example.com",
        "smp://c@smp1.simplex.im",
    ] {
        store.register(uri).await.unwrap();
    }

    let queue = Arc::new(InMemoryWorkQueue::new(RetryPolicy::default()));
    let scheduler = RescanScheduler::new(
        store.clone(),
        queue.clone(),
        "0 0 0 1 1 *",
        "simplex.im",
    )
    .unwrap();
    scheduler.start().await.unwrap();

    // 官方端点不进入全量重扫
    assert_eq!(scheduler.enqueue_full_rescan().await.unwrap(), 2);

    let pipeline = Arc::new(CheckPipeline::new(
        store.clone(),
        Arc::new(AlwaysUp),
        Arc::new(NoInfoPage),
        None,
        PipelineOptions::default(),
    ));
    let pool = WorkerPool::new(
        queue.clone(),
        pipeline,
        LoggingSystem::new(LogConfig::default()),
        2,
        Duration::from_millis(20),
    );
    pool.start().await.unwrap();

    // 新注册的端点由注册事件触发检测
    store.register("smp://d@three.example.com").await.unwrap();

    wait_for(|| {
        let queue = queue.clone();
        async move { queue.counts().await.unwrap().completed == 3 }
    })
    .await;

    pool.stop().await.unwrap();
    scheduler.stop().await.unwrap();

    for uri in [
        "smp://a@one.example.com",
        "smp://b@two.example.com",
        "smp://d@three.example.com",
    ] {
        let record = store.get(uri).await.unwrap().unwrap();
        assert_eq!(record.status, Some(true), "{uri}");
    }
    // 官方端点未被检测，记录保持未知
    let official = store.get("smp://c@smp1.simplex.im").await.unwrap().unwrap();
    assert_eq!(official.status, None);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.total(), 3);

    let status = scheduler.get_status().await;
    assert_eq!(status.last_rescan_jobs, 2);
    assert_eq!(status.reactive_jobs, 1);
    assert!(!status.is_running);

    let pool_status = pool.get_status().await;
    assert_eq!(pool_status.completed, 3);
}
