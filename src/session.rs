//! 물리 세션과 대여 핸들
//!
//! `Connector`/`PhysicalSession`은 네트워크 + 핸드셰이크를 담당하는 외부 구현과의 경계이다.
//! 풀은 세션을 열고, 살아있는지 확인하고, 초기화하고, 닫는 것 외에는 세션 내부를 모른다.

use crate::endpoint::EndpointDescriptor;
use crate::error::{ClientError, Result};
use crate::pool::Pool;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 서버 하나와의 실제 연결
#[async_trait]
pub trait PhysicalSession: Send + 'static {
    /// 서버가 부여한 연결 ID
    fn connection_id(&self) -> u64;

    /// 연결 상태 확인 (ping)
    async fn is_alive(&mut self) -> bool;

    /// 풀로 돌아가기 전 세션 상태 초기화
    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl std::fmt::Debug for dyn PhysicalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalSession")
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

/// endpoint 하나로 물리 세션을 여는 커넥터
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// `connect_timeout`이 0이면 커넥터 기본값을 따른다.
    async fn open(
        &self,
        endpoint: &EndpointDescriptor,
        connect_timeout: Duration,
    ) -> Result<Box<dyn PhysicalSession>>;
}

/// 호출자에게 대여된 세션 핸들
///
/// `close()`하면 물리 세션은 원래 풀로 돌아간다. 풀링이 꺼져 있으면 바로 닫힌다.
/// 닫지 않고 drop하면 백그라운드 태스크에서 반환된다.
pub struct LeasedSession {
    session: Option<Box<dyn PhysicalSession>>,
    pool: Option<Arc<Pool>>,
    endpoint: EndpointDescriptor,
}

impl LeasedSession {
    pub(crate) fn pooled(
        session: Box<dyn PhysicalSession>,
        pool: Arc<Pool>,
        endpoint: EndpointDescriptor,
    ) -> Self {
        LeasedSession {
            session: Some(session),
            pool: Some(pool),
            endpoint,
        }
    }

    pub(crate) fn unpooled(session: Box<dyn PhysicalSession>, endpoint: EndpointDescriptor) -> Self {
        LeasedSession {
            session: Some(session),
            pool: None,
            endpoint,
        }
    }

    /// 세션이 연결된 endpoint
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    /// 풀 ID (풀링이 꺼져 있으면 None)
    pub fn pool_id(&self) -> Option<&str> {
        self.pool.as_ref().map(|p| p.id())
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn connection_id(&self) -> Result<u64> {
        Ok(self.session()?.connection_id())
    }

    pub fn session(&self) -> Result<&dyn PhysicalSession> {
        self.session.as_deref().ok_or(ClientError::SessionClosed)
    }

    pub fn session_mut(&mut self) -> Result<&mut (dyn PhysicalSession + 'static)> {
        self.session.as_deref_mut().ok_or(ClientError::SessionClosed)
    }

    /// 구체 세션 타입으로 접근 (예: `MySqlSession`)
    pub fn downcast_mut<T: PhysicalSession>(&mut self) -> Result<&mut T> {
        self.session_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| ClientError::PoolError("unexpected session type".to_string()))
    }

    /// 세션 반환. 두 번째 호출부터는 아무 일도 하지 않는다.
    pub async fn close(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        match self.pool {
            Some(ref pool) => pool.release(session).await,
            None => {
                debug!("Closing unpooled session to {}", self.endpoint);
                let mut session = session;
                session.close().await;
            }
        }
        Ok(())
    }
}

impl Drop for LeasedSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    let mut session = session;
                    match pool {
                        Some(pool) => pool.release(session).await,
                        None => session.close().await,
                    }
                });
            }
            Err(_) => {
                // 런타임 밖: 세션은 닫지 못하고 슬롯만 회수
                warn!("Lease on {} dropped outside of a runtime", self.endpoint);
                if let Some(ref pool) = self.pool {
                    pool.forget(session);
                }
            }
        }
    }
}

impl std::fmt::Debug for LeasedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedSession")
            .field("endpoint", &self.endpoint)
            .field("pool_id", &self.pool_id())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{settle, MockConnector};

    #[tokio::test]
    async fn test_unpooled_close_is_idempotent() {
        let connector = MockConnector::new();
        let endpoint = EndpointDescriptor::new("db1", 33060);
        let session = connector.open(&endpoint, Duration::ZERO).await.unwrap();

        let mut lease = LeasedSession::unpooled(session, endpoint);
        assert!(lease.is_open());
        assert!(lease.pool_id().is_none());

        lease.close().await.unwrap();
        lease.close().await.unwrap();

        assert!(!lease.is_open());
        assert_eq!(connector.closed_count(), 1);
        assert!(matches!(lease.connection_id(), Err(ClientError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_unpooled_drop_closes_session() {
        let connector = MockConnector::new();
        let endpoint = EndpointDescriptor::new("db1", 33060);
        let session = connector.open(&endpoint, Duration::ZERO).await.unwrap();

        drop(LeasedSession::unpooled(session, endpoint));
        settle().await;

        assert_eq!(connector.closed_count(), 1);
    }
}
