use crate::config::{Backend, VirtualHostConfig};
use crate::health::{ProbeOutcome, Prober};
use crate::monitoring::MetricsCollector;
use crate::selector::SelectionStrategy;
use crate::store::{ManagedEntry, SharedHostsStore, UpsertOutcome};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// 虚拟主机生命周期状态
///
/// `Failed` 不是终态：控制器会在每个周期继续重试完整一轮候选。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualHostStatus {
    Initializing,
    Selecting,
    Healthy,
    Degraded,
    Failed,
}

impl VirtualHostStatus {
    pub fn as_metric(&self) -> i64 {
        match self {
            VirtualHostStatus::Initializing => 0,
            VirtualHostStatus::Selecting => 1,
            VirtualHostStatus::Healthy => 2,
            VirtualHostStatus::Degraded => 3,
            VirtualHostStatus::Failed => 4,
        }
    }
}

impl fmt::Display for VirtualHostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VirtualHostStatus::Initializing => "initializing",
            VirtualHostStatus::Selecting => "selecting",
            VirtualHostStatus::Healthy => "healthy",
            VirtualHostStatus::Degraded => "degraded",
            VirtualHostStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 虚拟主机运行状态，只由其控制器持有，不持久化
#[derive(Debug, Clone)]
pub struct VirtualHostState {
    /// 最近一次通过检查的后端下标
    pub active: Option<usize>,
    /// 活跃后端通过检查时实际连接的地址
    pub verified: Option<IpAddr>,
    pub consecutive_failures: u32,
    pub last_check: Option<Instant>,
    pub status: VirtualHostStatus,
    /// 最近一次成功写入文件的地址
    pub published: Option<IpAddr>,
    /// 选中的后端尚未成功写入文件，下个周期重试
    pub publish_pending: bool,
}

impl VirtualHostState {
    fn new() -> Self {
        Self {
            active: None,
            verified: None,
            consecutive_failures: 0,
            last_check: None,
            status: VirtualHostStatus::Initializing,
            published: None,
            publish_pending: false,
        }
    }
}

/// 虚拟主机控制器 - 运行检查/故障切换循环
pub struct VirtualHostController<P: Prober> {
    config: VirtualHostConfig,
    state: VirtualHostState,
    strategy: SelectionStrategy,
    prober: P,
    store: SharedHostsStore,
    metrics: Arc<MetricsCollector>,
}

impl<P: Prober> VirtualHostController<P> {
    pub fn new(
        config: VirtualHostConfig,
        prober: P,
        store: SharedHostsStore,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let strategy = SelectionStrategy::new(config.strategy);
        metrics.set_status(&config.hostname, VirtualHostStatus::Initializing.as_metric());
        Self {
            config,
            state: VirtualHostState::new(),
            strategy,
            prober,
            store,
            metrics,
        }
    }

    /// 当前活跃后端
    pub fn active_backend(&self) -> Option<&Backend> {
        self.state.active.map(|i| &self.config.backends[i])
    }

    /// 按检查间隔循环，直到收到关机信号
    ///
    /// 关机时正在进行的探测会被直接放弃；已经开始的文件写入在阻塞线程中完整结束。
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Virtual host '{}' starting: {} backend(s), strategy {}, interval {:?}, threshold {}",
            self.config.hostname,
            self.config.backends.len(),
            self.strategy.name(),
            self.config.check_interval,
            self.config.failure_threshold
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = self.tick() => {}
            }
        }

        info!("Virtual host '{}' stopped", self.config.hostname);
    }

    /// 执行一个检查周期
    pub async fn tick(&mut self) {
        self.state.last_check = Some(Instant::now());

        // 上个周期没写进去的选择先补写，不依赖本周期的探测结果
        if self.state.publish_pending {
            self.publish().await;
        }

        match self.state.status {
            VirtualHostStatus::Initializing
            | VirtualHostStatus::Selecting
            | VirtualHostStatus::Failed => self.search(None).await,
            VirtualHostStatus::Healthy | VirtualHostStatus::Degraded => self.check_active().await,
        }

        self.metrics
            .set_status(&self.config.hostname, self.state.status.as_metric());
    }

    /// 检查当前后端，达到阈值后触发故障切换
    async fn check_active(&mut self) {
        let Some(current) = self.state.active else {
            self.search(None).await;
            return;
        };

        if let Some(ip) = self.probe(current).await {
            if self.state.status == VirtualHostStatus::Degraded {
                info!(
                    "Virtual host '{}' recovered on {} after {} failure(s)",
                    self.config.hostname, self.config.backends[current], self.state.consecutive_failures
                );
            }
            self.state.consecutive_failures = 0;
            self.state.status = VirtualHostStatus::Healthy;
            self.state.verified = Some(ip);
            // 域名后端的地址可能变了
            if self.state.published != Some(ip) && !self.state.publish_pending {
                self.publish().await;
            }
            return;
        }

        self.state.consecutive_failures += 1;
        if self.state.consecutive_failures < self.config.failure_threshold {
            // 未达到阈值，不切换
            self.state.status = VirtualHostStatus::Degraded;
            debug!(
                "Virtual host '{}' degraded: {}/{} consecutive failures on {}",
                self.config.hostname,
                self.state.consecutive_failures,
                self.config.failure_threshold,
                self.config.backends[current]
            );
            return;
        }

        warn!(
            "Virtual host '{}': backend {} failed {} consecutive check(s), failing over",
            self.config.hostname, self.config.backends[current], self.state.consecutive_failures
        );
        self.search(Some(current)).await;
    }

    /// 按策略顺序尝试一整轮候选，第一个通过的后端被发布
    ///
    /// 全部失败时进入 `Failed`，已发布的记录保持不变。
    async fn search(&mut self, from: Option<usize>) {
        let previous_status = self.state.status;
        self.state.status = VirtualHostStatus::Selecting;
        self.metrics
            .set_status(&self.config.hostname, VirtualHostStatus::Selecting.as_metric());

        for attempt in 0..self.config.backends.len() {
            let Some((index, _)) = self.strategy.next(&self.config.backends, from, attempt) else {
                break;
            };
            let Some(ip) = self.probe(index).await else {
                continue;
            };

            let switched = self.state.active != Some(index);
            if switched && self.state.active.is_some() {
                self.metrics.record_failover(&self.config.hostname);
                info!(
                    "Virtual host '{}' switched to backend {}",
                    self.config.hostname, self.config.backends[index]
                );
            }

            self.state.active = Some(index);
            self.state.verified = Some(ip);
            self.state.consecutive_failures = 0;
            self.state.status = VirtualHostStatus::Healthy;
            if switched || (self.state.published != Some(ip) && !self.state.publish_pending) {
                self.publish().await;
            }
            return;
        }

        self.state.status = VirtualHostStatus::Failed;
        if previous_status != VirtualHostStatus::Failed {
            match self.active_backend() {
                Some(last) => warn!(
                    "Virtual host '{}': all {} backend(s) down, keeping last published backend {}",
                    self.config.hostname,
                    self.config.backends.len(),
                    last
                ),
                None => warn!(
                    "Virtual host '{}': all {} backend(s) down, nothing published yet",
                    self.config.hostname,
                    self.config.backends.len()
                ),
            }
        }
    }

    /// 探测单个后端，返回通过检查的地址；配置类错误记录后按失败处理
    async fn probe(&self, index: usize) -> Option<IpAddr> {
        let backend = &self.config.backends[index];
        let start = Instant::now();

        let verified = match self.prober.check(backend).await {
            Ok(ProbeOutcome::Healthy(ip)) => Some(ip),
            Ok(ProbeOutcome::Unhealthy(reason)) => {
                debug!(
                    "Virtual host '{}': probe of {} failed: {}",
                    self.config.hostname, backend, reason
                );
                None
            }
            Err(e) if e.is_configuration() => {
                error!(
                    "Virtual host '{}': cannot probe {}: {}",
                    self.config.hostname, backend, e
                );
                None
            }
            Err(e) => {
                warn!(
                    "Virtual host '{}': probe of {} errored: {}",
                    self.config.hostname, backend, e
                );
                None
            }
        };

        self.metrics.record_probe(
            &self.config.hostname,
            &backend.to_string(),
            verified.is_some(),
            start.elapsed(),
        );
        verified
    }

    /// 把活跃后端通过检查的地址写入共享文件；失败时保留选择，下个周期重写
    async fn publish(&mut self) {
        let (Some(index), Some(ip)) = (self.state.active, self.state.verified) else {
            return;
        };

        let entry = ManagedEntry::new(ip, self.config.published_names());
        match self.store.upsert(&self.config.hostname, entry).await {
            Ok(outcome) => {
                self.state.published = Some(ip);
                self.state.publish_pending = false;
                let result = match outcome {
                    UpsertOutcome::Written => "written",
                    UpsertOutcome::Unchanged => "unchanged",
                };
                self.metrics.record_write(&self.config.hostname, result);
                info!(
                    "Virtual host '{}' published {} ({})",
                    self.config.hostname, ip, self.config.backends[index]
                );
            }
            Err(e) => {
                self.state.publish_pending = e.is_retryable();
                self.metrics.record_write(&self.config.hostname, "error");
                error!(
                    "Virtual host '{}': failed to publish {}, will retry next cycle: {}",
                    self.config.hostname, self.config.backends[index], e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthCheck, StrategyKind};
    use crate::error::{RedirectorError, RedirectorResult};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 脚本化探测器：按主机名决定健康与否，并记录探测顺序
    #[derive(Clone, Default)]
    struct ScriptedProber {
        up: Arc<Mutex<HashSet<String>>>,
        probes: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProber {
        fn set_up(&self, host: &str, up: bool) {
            let mut hosts = self.up.lock().unwrap();
            if up {
                hosts.insert(host.to_string());
            } else {
                hosts.remove(host);
            }
        }

        fn take_probes(&self) -> Vec<String> {
            std::mem::take(&mut *self.probes.lock().unwrap())
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn check(&self, backend: &Backend) -> RedirectorResult<ProbeOutcome> {
            self.probes.lock().unwrap().push(backend.host.clone());
            if self.up.lock().unwrap().contains(&backend.host) {
                Ok(ProbeOutcome::Healthy(backend.host.parse().unwrap()))
            } else {
                Ok(ProbeOutcome::Unhealthy("scripted failure".to_string()))
            }
        }
    }

    fn vhost(hostname: &str, backends: &[&str], threshold: u32, strategy: StrategyKind) -> VirtualHostConfig {
        VirtualHostConfig {
            hostname: hostname.to_string(),
            aliases: Vec::new(),
            backends: backends.iter().map(|b| Backend::new(*b, None)).collect(),
            health_check: HealthCheck::Tcp {
                port: Some(80),
                timeout: Duration::from_millis(100),
            },
            check_interval: Duration::from_secs(1),
            failure_threshold: threshold,
            strategy,
        }
    }

    fn setup_store() -> (TempDir, SharedHostsStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        (dir, SharedHostsStore::new(path))
    }

    fn controller(
        config: VirtualHostConfig,
        prober: &ScriptedProber,
        store: &SharedHostsStore,
    ) -> VirtualHostController<ScriptedProber> {
        VirtualHostController::new(
            config,
            prober.clone(),
            store.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
        )
    }

    async fn published(store: &SharedHostsStore, id: &str) -> Option<String> {
        store
            .entries()
            .await
            .unwrap()
            .get(id)
            .map(|e| e.ip.to_string())
    }

    #[tokio::test]
    async fn test_initial_selection_publishes_first_healthy() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();
        prober.set_up("10.0.0.2", true);
        prober.set_up("10.0.0.3", true);

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1", "10.0.0.2", "10.0.0.3"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );
        ctrl.tick().await;

        assert_eq!(ctrl.state.status, VirtualHostStatus::Healthy);
        assert_eq!(ctrl.state.active, Some(1));
        assert_eq!(prober.take_probes(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_nothing_healthy_at_startup() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1", "10.0.0.2"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );
        ctrl.tick().await;

        assert_eq!(ctrl.state.status, VirtualHostStatus::Failed);
        assert_eq!(ctrl.state.active, None);
        assert_eq!(published(&store, "svc").await, None);

        // 之后任一后端恢复即发布
        prober.set_up("10.0.0.2", true);
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Healthy);
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_failover_threshold() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();
        prober.set_up("10.0.0.1", true);
        prober.set_up("10.0.0.2", true);

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1", "10.0.0.2"], 3, StrategyKind::Sequential),
            &prober,
            &store,
        );
        ctrl.tick().await;
        assert_eq!(ctrl.state.active, Some(0));
        prober.take_probes();

        // N-1 次失败后一次成功：计数清零，后端不变
        prober.set_up("10.0.0.1", false);
        ctrl.tick().await;
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Degraded);
        assert_eq!(ctrl.state.consecutive_failures, 2);

        prober.set_up("10.0.0.1", true);
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Healthy);
        assert_eq!(ctrl.state.consecutive_failures, 0);
        assert_eq!(ctrl.state.active, Some(0));
        assert_eq!(prober.take_probes(), vec!["10.0.0.1"; 3]);

        // 恰好N次连续失败才切换
        prober.set_up("10.0.0.1", false);
        ctrl.tick().await;
        ctrl.tick().await;
        assert_eq!(ctrl.state.active, Some(0));
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.1"));

        ctrl.tick().await;
        assert_eq!(ctrl.state.active, Some(1));
        assert_eq!(ctrl.state.status, VirtualHostStatus::Healthy);
        assert_eq!(ctrl.state.consecutive_failures, 0);
        assert_eq!(
            prober.take_probes(),
            vec!["10.0.0.1", "10.0.0.1", "10.0.0.1", "10.0.0.2"]
        );
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_end_to_end_failover_and_stale_entry() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();
        prober.set_up("10.0.0.2", true);

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1", "10.0.0.2"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );

        // 后端1首次探测失败，切到后端2
        ctrl.tick().await;
        assert_eq!(ctrl.state.active, Some(1));
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("\n10.0.0.2 svc\n"));

        // 后端2失败，回绕到后端1也失败 -> Failed，文件保持最后的有效值
        prober.set_up("10.0.0.2", false);
        prober.take_probes();
        ctrl.tick().await;
        assert_eq!(prober.take_probes(), vec!["10.0.0.2", "10.0.0.1", "10.0.0.2"]);
        assert_eq!(ctrl.state.status, VirtualHostStatus::Failed);
        assert_eq!(ctrl.state.active, Some(1));
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), content);

        // Failed 状态下每个周期重新完整搜索
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Failed);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), content);

        prober.set_up("10.0.0.1", true);
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Healthy);
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_single_backend_is_retried() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();
        prober.set_up("10.0.0.1", true);

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1"], 1, StrategyKind::Random),
            &prober,
            &store,
        );
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Healthy);

        prober.set_up("10.0.0.1", false);
        prober.take_probes();
        ctrl.tick().await;
        // 阈值触发后仍然重试唯一的后端
        assert_eq!(prober.take_probes(), vec!["10.0.0.1", "10.0.0.1"]);
        assert_eq!(ctrl.state.status, VirtualHostStatus::Failed);
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_random_failover_avoids_failed_backend() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();
        for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            prober.set_up(host, true);
        }

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1", "10.0.0.2", "10.0.0.3"], 1, StrategyKind::Random),
            &prober,
            &store,
        );
        ctrl.tick().await;
        let first = ctrl.state.active.unwrap();

        prober.set_up(&format!("10.0.0.{}", first + 1), false);
        ctrl.tick().await;
        let second = ctrl.state.active.unwrap();
        assert_ne!(first, second);
        assert_eq!(ctrl.state.status, VirtualHostStatus::Healthy);
    }

    #[tokio::test]
    async fn test_store_error_keeps_selection_and_retries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        let store = SharedHostsStore::new(&path);
        let prober = ScriptedProber::default();
        prober.set_up("10.0.0.1", true);

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );

        // hosts文件不存在：写入失败但选择保留
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Healthy);
        assert_eq!(ctrl.state.active, Some(0));
        assert!(ctrl.state.publish_pending);
        assert_eq!(ctrl.state.published, None);

        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        ctrl.tick().await;
        assert!(!ctrl.state.publish_pending);
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_config_error_from_prober_counts_as_failure() {
        struct BrokenProber;

        #[async_trait]
        impl Prober for BrokenProber {
            async fn check(&self, _backend: &Backend) -> RedirectorResult<ProbeOutcome> {
                Err(RedirectorError::config("no port"))
            }
        }

        let (_dir, store) = setup_store();
        let mut ctrl = VirtualHostController::new(
            vhost("svc", &["10.0.0.1"], 1, StrategyKind::Sequential),
            BrokenProber,
            store.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
        );
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Failed);
    }

    #[tokio::test]
    async fn test_concurrent_controllers_share_file() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();
        for host in ["10.0.0.1", "10.0.0.2", "10.1.0.1", "10.1.0.2"] {
            prober.set_up(host, true);
        }

        let mut a = controller(
            vhost("a", &["10.0.0.1", "10.0.0.2"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );
        let mut b = controller(
            vhost("b", &["10.1.0.1", "10.1.0.2"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );

        // a 每秒一次，b 每5秒一次，共10个模拟周期；期间后端交替故障
        let flapper = prober.clone();
        let task_a = tokio::spawn(async move {
            for tick in 0..10 {
                flapper.set_up("10.0.0.1", tick % 3 != 2);
                a.tick().await;
                tokio::task::yield_now().await;
            }
            a
        });
        let task_b = tokio::spawn(async move {
            for _ in 0..2 {
                b.tick().await;
                tokio::task::yield_now().await;
            }
            b
        });
        let a = task_a.await.unwrap();
        let b = task_b.await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.starts_with("127.0.0.1 localhost\n"));
        for id in ["a", "b"] {
            assert_eq!(content.matches(&SharedHostsStore::begin_marker(id)).count(), 1);
            assert_eq!(content.matches(&SharedHostsStore::end_marker(id)).count(), 1);
        }

        let entries = store.entries().await.unwrap();
        let expect: HashMap<&str, String> = [
            ("a", a.active_backend().unwrap().host.clone()),
            ("b", b.active_backend().unwrap().host.clone()),
        ]
        .into_iter()
        .collect();
        assert_eq!(entries["a"].ip.to_string(), expect["a"]);
        assert_eq!(entries["b"].ip.to_string(), expect["b"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();
        prober.set_up("10.0.0.1", true);

        let ctrl = controller(
            vhost("svc", &["10.0.0.1"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(ctrl.run(rx));

        // 第一个周期立即执行
        let deadline = Instant::now() + Duration::from_secs(5);
        while published(&store, "svc").await.is_none() {
            assert!(Instant::now() < deadline, "entry was never published");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("controller did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_write_retried_while_degraded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        let store = SharedHostsStore::new(&path);
        let prober = ScriptedProber::default();
        prober.set_up("10.0.0.1", true);

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1", "10.0.0.2"], 3, StrategyKind::Sequential),
            &prober,
            &store,
        );
        ctrl.tick().await;
        assert!(ctrl.state.publish_pending);

        // 文件恢复的同时后端出现一次抖动：仍然写入上次通过检查的地址
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        prober.set_up("10.0.0.1", false);
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Degraded);
        assert!(!ctrl.state.publish_pending);
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_pending_write_retried_while_failed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        let store = SharedHostsStore::new(&path);
        let prober = ScriptedProber::default();
        prober.set_up("10.0.0.1", true);

        let mut ctrl = controller(
            vhost("svc", &["10.0.0.1"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );
        ctrl.tick().await;
        assert!(ctrl.state.publish_pending);

        prober.set_up("10.0.0.1", false);
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Failed);
        assert!(ctrl.state.publish_pending);

        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        ctrl.tick().await;
        assert_eq!(ctrl.state.status, VirtualHostStatus::Failed);
        assert!(!ctrl.state.publish_pending);
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_publishes_address_that_passed_check() {
        /// 域名后端：探测结果里的地址才是要发布的地址
        struct NamedProber {
            answer: Arc<Mutex<IpAddr>>,
        }

        #[async_trait]
        impl Prober for NamedProber {
            async fn check(&self, _backend: &Backend) -> RedirectorResult<ProbeOutcome> {
                Ok(ProbeOutcome::Healthy(*self.answer.lock().unwrap()))
            }
        }

        let (_dir, store) = setup_store();
        let answer = Arc::new(Mutex::new("10.9.0.7".parse::<IpAddr>().unwrap()));
        let mut ctrl = VirtualHostController::new(
            vhost("svc", &["db.internal"], 1, StrategyKind::Sequential),
            NamedProber {
                answer: answer.clone(),
            },
            store.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
        );

        ctrl.tick().await;
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.9.0.7"));

        // 同一后端换了地址，下一次通过检查后重写
        *answer.lock().unwrap() = "10.9.0.8".parse().unwrap();
        ctrl.tick().await;
        assert_eq!(ctrl.state.active, Some(0));
        assert_eq!(published(&store, "svc").await.as_deref(), Some("10.9.0.8"));
    }

    #[tokio::test]
    async fn test_selecting_status_exported_during_search() {
        struct GaugeReader {
            metrics: Arc<MetricsCollector>,
            seen: Arc<Mutex<Vec<i64>>>,
        }

        #[async_trait]
        impl Prober for GaugeReader {
            async fn check(&self, _backend: &Backend) -> RedirectorResult<ProbeOutcome> {
                let value = self
                    .metrics
                    .virtual_host_status
                    .with_label_values(&["svc"])
                    .get();
                self.seen.lock().unwrap().push(value);
                Ok(ProbeOutcome::Unhealthy("down".to_string()))
            }
        }

        let (_dir, store) = setup_store();
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut ctrl = VirtualHostController::new(
            vhost("svc", &["10.0.0.1", "10.0.0.2"], 1, StrategyKind::Sequential),
            GaugeReader {
                metrics: metrics.clone(),
                seen: seen.clone(),
            },
            store,
            metrics.clone(),
        );
        ctrl.tick().await;

        let selecting = VirtualHostStatus::Selecting.as_metric();
        assert_eq!(*seen.lock().unwrap(), vec![selecting, selecting]);
        assert_eq!(
            metrics.virtual_host_status.with_label_values(&["svc"]).get(),
            VirtualHostStatus::Failed.as_metric()
        );
    }

    #[tokio::test]
    async fn test_shutdown_abandons_inflight_probe() {
        /// 永不返回的探测，用来模拟卡住的后端
        struct HangingProber {
            started: Arc<tokio::sync::Notify>,
        }

        #[async_trait]
        impl Prober for HangingProber {
            async fn check(&self, _backend: &Backend) -> RedirectorResult<ProbeOutcome> {
                self.started.notify_one();
                std::future::pending().await
            }
        }

        let (_dir, store) = setup_store();
        let started = Arc::new(tokio::sync::Notify::new());
        let ctrl = VirtualHostController::new(
            vhost("svc", &["10.0.0.1"], 1, StrategyKind::Sequential),
            HangingProber {
                started: started.clone(),
            },
            store.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
        );
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(ctrl.run(rx));

        started.notified().await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("controller kept waiting on the probe")
            .unwrap();
        assert_eq!(published(&store, "svc").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loops_follow_their_intervals() {
        let (_dir, store) = setup_store();
        let prober = ScriptedProber::default();
        for host in ["10.0.0.1", "10.0.0.2", "10.1.0.1", "10.1.0.2"] {
            prober.set_up(host, true);
        }

        let a = controller(
            vhost("a", &["10.0.0.1", "10.0.0.2"], 1, StrategyKind::Sequential),
            &prober,
            &store,
        );
        let mut b_config = vhost("b", &["10.1.0.1", "10.1.0.2"], 1, StrategyKind::Sequential);
        b_config.check_interval = Duration::from_secs(5);
        let b = controller(b_config, &prober, &store);

        let (tx, _) = broadcast::channel(1);
        let task_a = tokio::spawn(a.run(tx.subscribe()));
        let task_b = tokio::spawn(b.run(tx.subscribe()));

        // a 在第3秒前失去后端1，第7秒前后端2也失去而后端1恢复
        tokio::time::sleep(Duration::from_millis(2500)).await;
        prober.set_up("10.0.0.1", false);
        tokio::time::sleep(Duration::from_secs(4)).await;
        prober.set_up("10.0.0.2", false);
        prober.set_up("10.0.0.1", true);
        tokio::time::sleep(Duration::from_secs(4)).await;

        tx.send(()).unwrap();
        task_a.await.unwrap();
        task_b.await.unwrap();

        let probes = prober.take_probes();
        let a_probes = probes.iter().filter(|h| h.starts_with("10.0.")).count();
        let b_probes = probes.iter().filter(|h| h.starts_with("10.1.")).count();
        // 10.5秒内：a 在0..=10秒各一次加两次切换时的额外探测，b 在0、5、10秒
        assert_eq!(b_probes, 3);
        assert_eq!(a_probes, 11 + 2);

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.starts_with("127.0.0.1 localhost\n"));
        for id in ["a", "b"] {
            assert_eq!(content.matches(&SharedHostsStore::begin_marker(id)).count(), 1);
            assert_eq!(content.matches(&SharedHostsStore::end_marker(id)).count(), 1);
        }
        let entries = store.entries().await.unwrap();
        assert_eq!(entries["a"].ip.to_string(), "10.0.0.1");
        assert_eq!(entries["b"].ip.to_string(), "10.1.0.1");
    }
}
