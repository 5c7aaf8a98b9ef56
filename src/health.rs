use crate::config::{Backend, HealthCheck, HttpScheme, StatusRange};
use crate::error::{RedirectorError, RedirectorResult};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// 单次探测结果
///
/// 超时、连接被拒绝、状态码不符、域名解析失败都属于 `Unhealthy`，是正常结果而不是错误。
/// `Healthy` 携带实际通过检查的地址，发布时写入的就是这个地址。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy(IpAddr),
    Unhealthy(String),
}

/// 探测接口 - 控制器通过它检查后端是否存活
#[async_trait]
pub trait Prober: Send + Sync {
    /// 对一个后端执行一次存活检查；只在配置错误时返回 `Err`
    async fn check(&self, backend: &Backend) -> RedirectorResult<ProbeOutcome>;
}

/// 健康探测器
pub enum HealthProbe {
    Tcp {
        port: Option<u16>,
        timeout: Duration,
    },
    Http {
        client: reqwest::Client,
        scheme: HttpScheme,
        port: Option<u16>,
        path: String,
        expected_status: Vec<StatusRange>,
        timeout: Duration,
    },
}

impl HealthProbe {
    pub fn from_config(check: &HealthCheck) -> RedirectorResult<Self> {
        match check {
            HealthCheck::Tcp { port, timeout } => Ok(HealthProbe::Tcp {
                port: *port,
                timeout: *timeout,
            }),
            HealthCheck::Http {
                scheme,
                port,
                path,
                expected_status,
                timeout,
            } => Ok(HealthProbe::Http {
                client: Self::http_client(*timeout, None)?,
                scheme: *scheme,
                port: port.or(Some(scheme.default_port())),
                path: path.clone(),
                expected_status: expected_status.clone(),
                timeout: *timeout,
            }),
        }
    }

    /// 构建HTTP客户端；`pin` 把域名固定到一个已解析的地址
    fn http_client(
        timeout: Duration,
        pin: Option<(&str, SocketAddr)>,
    ) -> RedirectorResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none());
        if let Some((host, addr)) = pin {
            builder = builder.resolve(host, addr);
        }
        builder
            .build()
            .map_err(|e| RedirectorError::config(format!("failed to build HTTP client: {}", e)))
    }

    /// TCP健康检查：在超时内建立连接即为成功，随后立即关闭
    async fn tcp_check(addr: SocketAddr, timeout_duration: Duration) -> ProbeOutcome {
        let start_time = Instant::now();

        match timeout(timeout_duration, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                debug!("TCP check to {} succeeded in {:?}", addr, start_time.elapsed());
                ProbeOutcome::Healthy(addr.ip())
            }
            Ok(Err(e)) => ProbeOutcome::Unhealthy(format!("connection to {} failed: {}", addr, e)),
            Err(_) => ProbeOutcome::Unhealthy(format!(
                "connection to {} timed out after {:?}",
                addr, timeout_duration
            )),
        }
    }

    /// HTTP健康检查：状态码命中期望区间且响应体在超时内读完
    async fn http_check(
        client: &reqwest::Client,
        url: &str,
        ip: IpAddr,
        expected_status: &[StatusRange],
        timeout_duration: Duration,
    ) -> ProbeOutcome {
        let request = async {
            let response = client.get(url).send().await?;
            let status = response.status().as_u16();
            // 读完响应体才算成功
            response.bytes().await?;
            Ok::<u16, reqwest::Error>(status)
        };

        match timeout(timeout_duration, request).await {
            Ok(Ok(status)) if expected_status.iter().any(|r| r.contains(status)) => {
                debug!("HTTP check {} via {} returned {}", url, ip, status);
                ProbeOutcome::Healthy(ip)
            }
            Ok(Ok(status)) => ProbeOutcome::Unhealthy(format!("unexpected status {}", status)),
            Ok(Err(e)) => ProbeOutcome::Unhealthy(format!("request failed: {}", e)),
            Err(_) => ProbeOutcome::Unhealthy(format!("request timeout after {:?}", timeout_duration)),
        }
    }
}

/// 每次探测只解析一次，连接和发布都用同一个地址
async fn resolve_for_probe(backend: &Backend) -> Result<IpAddr, ProbeOutcome> {
    backend
        .resolve()
        .await
        .map_err(|e| ProbeOutcome::Unhealthy(e.to_string()))
}

#[async_trait]
impl Prober for HealthProbe {
    async fn check(&self, backend: &Backend) -> RedirectorResult<ProbeOutcome> {
        match self {
            HealthProbe::Tcp { port, timeout } => {
                let port = backend.port.or(*port).ok_or_else(|| {
                    RedirectorError::config(format!("no port to probe for backend '{}'", backend))
                })?;
                let ip = match resolve_for_probe(backend).await {
                    Ok(ip) => ip,
                    Err(outcome) => return Ok(outcome),
                };
                Ok(Self::tcp_check(SocketAddr::new(ip, port), *timeout).await)
            }
            HealthProbe::Http {
                client,
                scheme,
                port,
                path,
                expected_status,
                timeout,
            } => {
                let port = backend.port.or(*port).unwrap_or(scheme.default_port());
                let url = format!(
                    "{}://{}:{}{}",
                    scheme.as_str(),
                    backend.url_host(),
                    port,
                    path
                );
                reqwest::Url::parse(&url).map_err(|e| {
                    RedirectorError::config(format!("invalid health check URL '{}': {}", url, e))
                })?;
                let ip = match resolve_for_probe(backend).await {
                    Ok(ip) => ip,
                    Err(outcome) => return Ok(outcome),
                };

                // 域名后端：把请求固定到刚解析出的地址，Host头和SNI保持原域名
                let pinned;
                let client = if backend.ip().is_some() {
                    client
                } else {
                    pinned = Self::http_client(
                        *timeout,
                        Some((backend.host.as_str(), SocketAddr::new(ip, port))),
                    )?;
                    &pinned
                };
                Ok(Self::http_check(client, &url, ip, expected_status, *timeout).await)
            }
        }
    }
}
