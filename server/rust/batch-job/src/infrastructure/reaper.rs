use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::usecase::ReapStaleJobsUseCase;

/// StaleJobReaper は一定間隔で ReapStaleJobsUseCase を実行するバックグラウンドタスク。
pub struct StaleJobReaper {
    reap_uc: Arc<ReapStaleJobsUseCase>,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl StaleJobReaper {
    pub fn new(reap_uc: Arc<ReapStaleJobsUseCase>, interval: Duration) -> Self {
        Self {
            reap_uc,
            interval,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let reap_uc = self.reap_uc.clone();
        let interval = self.interval;
        let token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = reap_uc.execute().await {
                            tracing::error!(error = %e, "stale job reaper tick failed");
                        }
                    }
                }
            }
            tracing::info!("stale job reaper stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }
}
