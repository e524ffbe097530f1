//! 单个端点的检测流水线
//!
//! 顺序执行：官方端点判定 → 可达性测试 → URI解析 → 国家解析 → 信息页面探测 → 写入状态存储。
//! 网络抖动类错误被折叠为布尔结果，只有协议错误和存储错误会让任务失败。

use crate::endpoint::uri::{classify, is_official_with_marker, is_onion, TOR_COUNTRY};
use crate::endpoint::{CheckOutcome, StatusUpdate, UpdateOutcome};
use crate::error::PipelineError;
use crate::logging::JobLog;
use crate::probe::{CountryResolver, InfoPageProber, ReachabilityProber};
use crate::store::StatusStore;
use chrono::Utc;
use std::sync::Arc;

/// 流水线选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// 官方端点的域名标识
    pub official_marker: String,
    /// 可达性测试尝试次数，任意一次成功即视为可达
    pub reachability_attempts: u32,
    /// 只运行探测，不修改状态存储
    pub dry_run: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            official_marker: crate::endpoint::uri::DEFAULT_OFFICIAL_MARKER.to_string(),
            reachability_attempts: 1,
            dry_run: false,
        }
    }
}

/// 一次流水线运行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// 官方端点，记录已删除（`deleted` 为记录原本是否存在）
    OfficialRemoved { deleted: bool },
    /// 官方端点，演练模式下未删除
    OfficialSkipped,
    /// 已完成检测并写入状态存储
    Checked {
        outcome: CheckOutcome,
        update: UpdateOutcome,
    },
    /// 已完成检测，演练模式下未写入
    DryRun(CheckOutcome),
}

impl PipelineOutcome {
    /// 检测结果（官方端点没有检测结果）
    pub fn check_outcome(&self) -> Option<&CheckOutcome> {
        match self {
            PipelineOutcome::Checked { outcome, .. } | PipelineOutcome::DryRun(outcome) => {
                Some(outcome)
            }
            PipelineOutcome::OfficialRemoved { .. } | PipelineOutcome::OfficialSkipped => None,
        }
    }
}

/// 检测流水线
///
/// 不持有跨任务状态，同一实例可以被多个工作者并发使用。
pub struct CheckPipeline {
    store: Arc<dyn StatusStore>,
    reachability: Arc<dyn ReachabilityProber>,
    info_page: Arc<dyn InfoPageProber>,
    geo: Option<Arc<dyn CountryResolver>>,
    options: PipelineOptions,
}

impl CheckPipeline {
    /// 创建检测流水线
    ///
    /// # 参数
    /// * `store` - 状态存储
    /// * `reachability` - 可达性探测器
    /// * `info_page` - 信息页面探测器
    /// * `geo` - 国家解析器，未配置GeoIP数据库时为 `None`
    /// * `options` - 流水线选项
    pub fn new(
        store: Arc<dyn StatusStore>,
        reachability: Arc<dyn ReachabilityProber>,
        info_page: Arc<dyn InfoPageProber>,
        geo: Option<Arc<dyn CountryResolver>>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            reachability,
            info_page,
            geo,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// 对一个端点执行完整的检测流程
    pub async fn run(&self, uri: &str, log: &JobLog) -> Result<PipelineOutcome, PipelineError> {
        if is_official_with_marker(uri, &self.options.official_marker) {
            if self.options.dry_run {
                log.log("官方服务器，演练模式下跳过删除").await;
                return Ok(PipelineOutcome::OfficialSkipped);
            }
            log.log("官方服务器，删除记录...").await;
            let deleted = self.store.delete(uri).await?;
            log.log("完成").await;
            return Ok(PipelineOutcome::OfficialRemoved { deleted });
        }

        log.log(&format!("测试 {uri}...")).await;
        let reachable = self.test_reachability(uri, log).await?;
        log.log(&format!("完成: {reachable}")).await;

        let parsed = classify(uri);

        let country = if is_onion(uri) {
            Some(TOR_COUNTRY.to_string())
        } else {
            match &parsed.domain {
                Some(domain) => self.resolve_country(domain, log).await,
                None => None,
            }
        };

        let info_page_available = match &parsed.domain {
            Some(domain) => {
                log.log(&format!("检测信息页面 {domain}...")).await;
                let available = self.info_page.has_info_page(domain).await;
                log.log(&format!("完成: {available}")).await;
                available
            }
            None => false,
        };

        let outcome = CheckOutcome {
            reachable,
            country,
            info_page_available,
        };

        if self.options.dry_run {
            log.log("演练模式，不写入状态存储").await;
            return Ok(PipelineOutcome::DryRun(outcome));
        }

        log.log("更新状态记录...").await;
        let update = self
            .store
            .update(uri, &StatusUpdate::from(&outcome), Utc::now())
            .await?;
        match update {
            UpdateOutcome::Applied(_) => log.log("完成").await,
            UpdateOutcome::Missing => log.log("记录已不存在，跳过").await,
        }

        Ok(PipelineOutcome::Checked { outcome, update })
    }

    /// 可达性测试，传输错误记为不可达，协议错误直接失败
    async fn test_reachability(&self, uri: &str, log: &JobLog) -> Result<bool, PipelineError> {
        let attempts = self.options.reachability_attempts.max(1);

        for attempt in 1..=attempts {
            match self.reachability.test_endpoint(uri).await {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    if attempt < attempts {
                        log.log(&format!("第 {attempt} 次测试失败，重试")).await;
                    }
                }
                Err(e) if e.is_transport() => {
                    log.log(&format!("第 {attempt} 次测试出错: {e}")).await;
                }
                Err(e) => {
                    log.log(&format!("测试响应无效: {e}")).await;
                    return Err(PipelineError::Protocol(e));
                }
            }
        }

        Ok(false)
    }

    /// 国家解析，失败时记录日志并返回 `None`
    async fn resolve_country(&self, domain: &str, log: &JobLog) -> Option<String> {
        let Some(geo) = &self.geo else {
            tracing::debug!("未配置GeoIP数据库，跳过国家解析");
            return None;
        };

        log.log("检测地理位置...").await;
        match geo.resolve_country(domain).await {
            Ok(country) => {
                log.log(&format!("完成: {country}")).await;
                Some(country)
            }
            Err(e) => {
                log.log(&format!("检测国家时出错: {e}")).await;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GeoError, ProbeError};
    use crate::store::InMemoryStatusStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// 按顺序返回预设结果的可达性探测器
    struct ScriptedProber {
        results: Mutex<VecDeque<Result<bool, ProbeError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProber {
        fn new(results: Vec<Result<bool, ProbeError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ReachabilityProber for ScriptedProber {
        async fn test_endpoint(&self, _uri: &str) -> Result<bool, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .await
                .pop_front()
                .unwrap_or(Ok(false))
        }
    }

    struct FixedInfoPage(bool);

    #[async_trait]
    impl InfoPageProber for FixedInfoPage {
        async fn has_info_page(&self, _domain: &str) -> bool {
            self.0
        }
    }

    struct FailingGeo;

    #[async_trait]
    impl CountryResolver for FailingGeo {
        async fn resolve_country(&self, domain: &str) -> Result<String, GeoError> {
            Err(GeoError::Dns {
                domain: domain.to_string(),
                reason: "NXDOMAIN".to_string(),
            })
        }
    }

    fn pipeline(
        store: Arc<InMemoryStatusStore>,
        prober: Arc<ScriptedProber>,
        options: PipelineOptions,
    ) -> CheckPipeline {
        CheckPipeline::new(
            store,
            prober,
            Arc::new(FixedInfoPage(true)),
            Some(Arc::new(FailingGeo) as Arc<dyn CountryResolver>),
            options,
        )
    }

    #[tokio::test]
    async fn test_transport_error_counts_as_unreachable() {
        let store = Arc::new(InMemoryStatusStore::new());
        store.register("smp://k@relay.example.com").await.unwrap();
        let prober = ScriptedProber::new(vec![Err(ProbeError::Timeout(10_000))]);

        let result = pipeline(store.clone(), prober, PipelineOptions::default())
            .run("smp://k@relay.example.com", &JobLog::detached(1))
            .await
            .unwrap();

        let outcome = result.check_outcome().unwrap();
        assert!(!outcome.reachable);
        // 国家解析失败不写入国家
        assert!(outcome.country.is_none());
        let record = store.get("smp://k@relay.example.com").await.unwrap().unwrap();
        assert_eq!(record.status, Some(false));
    }

    #[tokio::test]
    async fn test_protocol_error_fails_job() {
        let store = Arc::new(InMemoryStatusStore::new());
        store.register("smp://k@relay.example.com").await.unwrap();
        let prober = ScriptedProber::new(vec![Err(ProbeError::Protocol("bad json".to_string()))]);

        let result = pipeline(store.clone(), prober, PipelineOptions::default())
            .run("smp://k@relay.example.com", &JobLog::detached(1))
            .await;

        assert!(matches!(result, Err(PipelineError::Protocol(_))));
        let record = store.get("smp://k@relay.example.com").await.unwrap().unwrap();
        assert!(record.status.is_none());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let store = Arc::new(InMemoryStatusStore::new());
        store.register("smp://k@relay.example.com").await.unwrap();
        let prober = ScriptedProber::new(vec![
            Err(ProbeError::Transport("reset".to_string())),
            Ok(false),
            Ok(true),
        ]);
        let options = PipelineOptions {
            reachability_attempts: 3,
            ..PipelineOptions::default()
        };

        let result = pipeline(store, prober.clone(), options)
            .run("smp://k@relay.example.com", &JobLog::detached(1))
            .await
            .unwrap();

        assert!(result.check_outcome().unwrap().reachable);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dry_run_leaves_store_untouched() {
        let store = Arc::new(InMemoryStatusStore::new());
        store.register("smp://k@relay.example.com").await.unwrap();
        store.register("smp://o@smp4.simplex.im").await.unwrap();
        let options = PipelineOptions {
            dry_run: true,
            ..PipelineOptions::default()
        };
        let pipeline = pipeline(store.clone(), ScriptedProber::new(vec![Ok(true)]), options);

        let result = pipeline
            .run("smp://k@relay.example.com", &JobLog::detached(1))
            .await
            .unwrap();
        assert!(matches!(result, PipelineOutcome::DryRun(_)));
        let official = pipeline
            .run("smp://o@smp4.simplex.im", &JobLog::detached(2))
            .await
            .unwrap();
        assert_eq!(official, PipelineOutcome::OfficialSkipped);

        assert_eq!(store.get_all().await.unwrap().len(), 2);
        let record = store.get("smp://k@relay.example.com").await.unwrap().unwrap();
        assert!(record.last_check.is_none());
    }

    #[tokio::test]
    async fn test_missing_record_is_not_an_error() {
        let store = Arc::new(InMemoryStatusStore::new());
        let result = pipeline(store, ScriptedProber::new(vec![Ok(true)]), PipelineOptions::default())
            .run("smp://k@gone.example.com", &JobLog::detached(1))
            .await
            .unwrap();

        assert!(matches!(
            result,
            PipelineOutcome::Checked {
                update: UpdateOutcome::Missing,
                ..
            }
        ));
    }
}
