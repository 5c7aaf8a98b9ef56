use crate::config::{VirtualHostSpec, validate_virtual_hosts};
use crate::controller::VirtualHostController;
use crate::error::{RedirectorError, RedirectorResult};
use crate::health::HealthProbe;
use crate::monitoring::MetricsCollector;
use crate::store::SharedHostsStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 启动结果
#[derive(Debug, Default)]
pub struct StartReport {
    /// 已启动的虚拟主机
    pub started: Vec<String>,
    /// 因配置错误未启动的虚拟主机
    pub rejected: Vec<(String, RedirectorError)>,
    /// 被清理掉的过期托管块
    pub pruned: Vec<String>,
}

/// 监督器 - 为每个虚拟主机启动一个控制器，并持有唯一的共享hosts文件实例
pub struct Supervisor {
    store: SharedHostsStore,
    metrics: Arc<MetricsCollector>,
    prune_stale_blocks: bool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(store: SharedHostsStore, metrics: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            metrics,
            prune_stale_blocks: true,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn with_prune_stale_blocks(mut self, enabled: bool) -> Self {
        self.prune_stale_blocks = enabled;
        self
    }

    /// 启动所有虚拟主机控制器
    ///
    /// 只有hosts文件不可写会返回错误；单个虚拟主机的配置错误只会跳过该主机。
    pub async fn start(&mut self, virtual_hosts: &[VirtualHostSpec]) -> Result<StartReport> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.validate_access())
            .await
            .context("Hosts file access check panicked")?
            .with_context(|| {
                format!(
                    "Cannot acquire write access to {}",
                    self.store.path().display()
                )
            })?;

        let mut report = StartReport::default();

        if self.prune_stale_blocks {
            let configured: Vec<String> = virtual_hosts.iter().map(|v| v.hostname.clone()).collect();
            match self.store.retain(configured).await {
                Ok(pruned) => report.pruned = pruned,
                Err(e) => warn!("Failed to prune stale managed blocks: {}", e),
            }
        }

        match self.store.entries().await {
            Ok(entries) => {
                for (id, entry) in entries {
                    info!("Previously published entry for '{}': {}", id, entry);
                }
            }
            Err(e) => warn!("Cannot read existing managed blocks: {}", e),
        }

        for (name, result) in validate_virtual_hosts(virtual_hosts) {
            match result.and_then(|config| self.spawn(config)) {
                Ok(()) => report.started.push(name),
                Err(e) => {
                    error!("Virtual host '{}' not started: {}", name, e);
                    report.rejected.push((name, e));
                }
            }
        }

        info!(
            "Supervisor started {} virtual host(s), {} rejected",
            report.started.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    fn spawn(&mut self, config: crate::config::VirtualHostConfig) -> RedirectorResult<()> {
        let probe = HealthProbe::from_config(&config.health_check)?;
        let name = config.hostname.clone();
        let controller =
            VirtualHostController::new(config, probe, self.store.clone(), self.metrics.clone());

        let handle = tokio::spawn(controller.run(self.shutdown_tx.subscribe()));
        self.tasks.push((name, handle));
        Ok(())
    }

    /// 通知所有控制器停止调度新的检查
    pub fn shutdown(&self) {
        info!("Stopping {} virtual host controller(s)", self.tasks.len());
        let _ = self.shutdown_tx.send(());
    }

    /// 等待所有控制器退出
    pub async fn wait(&mut self) {
        for (name, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                error!("Virtual host '{}' task failed: {}", name, e);
            }
        }
    }

    /// 停止全部控制器后按新配置重新启动
    pub async fn reload(&mut self, virtual_hosts: &[VirtualHostSpec]) -> Result<StartReport> {
        info!("Reloading virtual hosts...");
        self.shutdown();
        self.wait().await;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = shutdown_tx;
        self.start(virtual_hosts).await
    }
}
