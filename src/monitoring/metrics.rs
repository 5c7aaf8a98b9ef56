use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec, IntGaugeVec, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use warp::Filter;
use warp::http::StatusCode;
use warp::path::FullPath;

/// 监控指标收集器
pub struct MetricsCollector {
    registry: Registry,

    // 探测指标
    pub probes_total: IntCounterVec,
    pub probe_duration: HistogramVec,

    // 切换与写入指标
    pub failovers_total: IntCounterVec,
    pub hosts_file_writes: IntCounterVec,

    // 状态指标
    pub virtual_host_status: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let probes_total = IntCounterVec::new(
            prometheus::Opts::new("redirector_probes_total", "Total number of health probes"),
            &["virtual_host", "backend", "result"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let probe_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "redirector_probe_duration_seconds",
                "Health probe duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["virtual_host"],
        )?;
        registry.register(Box::new(probe_duration.clone()))?;

        let failovers_total = IntCounterVec::new(
            prometheus::Opts::new(
                "redirector_failovers_total",
                "Total number of backend switches",
            ),
            &["virtual_host"],
        )?;
        registry.register(Box::new(failovers_total.clone()))?;

        let hosts_file_writes = IntCounterVec::new(
            prometheus::Opts::new(
                "redirector_hosts_file_writes_total",
                "Hosts file publish attempts by result",
            ),
            &["virtual_host", "result"],
        )?;
        registry.register(Box::new(hosts_file_writes.clone()))?;

        let virtual_host_status = IntGaugeVec::new(
            prometheus::Opts::new(
                "redirector_virtual_host_status",
                "Virtual host status (0 initializing, 1 selecting, 2 healthy, 3 degraded, 4 failed)",
            ),
            &["virtual_host"],
        )?;
        registry.register(Box::new(virtual_host_status.clone()))?;

        Ok(Self {
            registry,
            probes_total,
            probe_duration,
            failovers_total,
            hosts_file_writes,
            virtual_host_status,
        })
    }

    /// 记录一次探测
    pub fn record_probe(&self, virtual_host: &str, backend: &str, healthy: bool, duration: Duration) {
        let result = if healthy { "healthy" } else { "unhealthy" };
        self.probes_total
            .with_label_values(&[virtual_host, backend, result])
            .inc();
        self.probe_duration
            .with_label_values(&[virtual_host])
            .observe(duration.as_secs_f64());
    }

    pub fn record_failover(&self, virtual_host: &str) {
        self.failovers_total.with_label_values(&[virtual_host]).inc();
    }

    /// 记录hosts文件写入，result 为 written / unchanged / error
    pub fn record_write(&self, virtual_host: &str, result: &str) {
        self.hosts_file_writes
            .with_label_values(&[virtual_host, result])
            .inc();
    }

    pub fn set_status(&self, virtual_host: &str, status: i64) {
        self.virtual_host_status
            .with_label_values(&[virtual_host])
            .set(status);
    }

    /// 导出指标为Prometheus格式
    pub fn export_metrics(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))
    }
}

/// 启动指标HTTP服务，收到关机信号后停止
pub fn serve_metrics(
    collector: Arc<MetricsCollector>,
    bind: SocketAddr,
    path: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<SocketAddr> {
    // 路径可以有多段（如 api/metrics），按完整路径匹配
    let expected = format!("/{}", path.trim_matches('/'));
    let route = warp::get()
        .and(warp::path::full())
        .and_then(move |full: FullPath| {
            let matched = full.as_str() == expected;
            async move {
                if matched {
                    Ok(())
                } else {
                    Err(warp::reject::not_found())
                }
            }
        })
        .untuple_one()
        .map(move || match collector.export_metrics() {
            Ok(body) => warp::reply::with_status(body, StatusCode::OK),
            Err(e) => warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
        });

    let (addr, server) = warp::serve(route).try_bind_with_graceful_shutdown(bind, async move {
        let _ = shutdown.recv().await;
    })?;
    tokio::spawn(server);

    info!("Metrics endpoint listening on http://{}/{}", addr, path.trim_matches('/'));
    Ok(addr)
}
