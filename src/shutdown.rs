use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{error, info};

/// 进程信号类型
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP (重新加载配置)
    Hangup,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// 信号管理器 - 把操作系统信号转成广播消息
pub struct GracefulShutdown {
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(16);
        Self { signal_tx }
    }

    /// 获取信号接收器
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    /// 启动信号监听
    pub async fn start_signal_handling(&self) -> Result<()> {
        let signal_tx_int = self.signal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
                return;
            }
            info!("Received SIGINT signal");
            let _ = signal_tx_int.send(ShutdownSignal::Interrupt);
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = signal(SignalKind::terminate())?;
            let signal_tx_term = self.signal_tx.clone();
            tokio::spawn(async move {
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    let _ = signal_tx_term.send(ShutdownSignal::Terminate);
                }
            });

            // SIGHUP 可以多次触发
            let mut sighup = signal(SignalKind::hangup())?;
            let signal_tx_hup = self.signal_tx.clone();
            tokio::spawn(async move {
                while sighup.recv().await.is_some() {
                    info!("Received SIGHUP signal");
                    if signal_tx_hup.send(ShutdownSignal::Hangup).is_err() {
                        break;
                    }
                }
            });
        }

        info!("Signal handlers registered successfully");
        Ok(())
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hangup_is_broadcast_repeatedly() {
        let signals = GracefulShutdown::new();
        let mut rx = signals.subscribe();
        signals.start_signal_handling().await.unwrap();

        let pid = std::process::id().to_string();
        for _ in 0..2 {
            let status = std::process::Command::new("kill")
                .args(["-HUP", &pid])
                .status()
                .unwrap();
            assert!(status.success());

            let signal = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("SIGHUP was not forwarded")
                .unwrap();
            assert_eq!(signal, ShutdownSignal::Hangup);
        }
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(ShutdownSignal::Hangup.to_string(), "SIGHUP");
    }
}
