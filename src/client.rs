//! 클라이언트 - 라우터와 풀 레지스트리를 묶는 진입점
//!
//! 풀은 클라이언트 인스턴스마다 따로 가지며 다른 클라이언트와 공유하지 않는다.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::pool::{PoolRegistry, PoolStatus};
use crate::router::Router;
use crate::session::{Connector, LeasedSession};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct Client {
    config: ClientConfig,
    router: Router,
    pools: PoolRegistry,
}

impl Client {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.pooling.validate()?;
        let router = Router::new(config.endpoints.clone())?;
        let pools = PoolRegistry::new(config.pooling.clone(), connector);

        info!(
            "Client created: {} endpoint(s), pooling {}, max_size {}",
            config.endpoints.len(),
            if config.pooling.enabled { "enabled" } else { "disabled" },
            config.pooling.max_size
        );

        Ok(Client {
            config,
            router,
            pools,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// 설정된 connect_timeout으로 세션 획득
    pub async fn get_session(&self) -> Result<LeasedSession> {
        self.get_session_with_timeout(self.config.connect_timeout).await
    }

    pub async fn get_session_with_timeout(&self, connect_timeout: Duration) -> Result<LeasedSession> {
        if self.pools.is_closed() {
            return Err(ClientError::PoolError("client is closed".to_string()));
        }
        self.router.get_session(&self.pools, connect_timeout).await
    }

    /// 클라이언트 종료. 대여 중인 세션은 반환될 때 닫힌다.
    pub async fn close(&self) {
        if self.pools.is_closed() {
            return;
        }
        self.pools.close().await;
        info!("Client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pools.is_closed()
    }

    pub fn pool_status(&self) -> Vec<PoolStatus> {
        self.pools.status()
    }

    /// 오래된 유휴 세션 정리
    pub async fn sweep_idle(&self) -> usize {
        self.pools.sweep_idle().await
    }
}
