//! 테스트용 메모리 커넥터

use crate::endpoint::EndpointDescriptor;
use crate::error::{ClientError, Result};
use crate::session::{Connector, PhysicalSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    next_id: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    unreachable: Mutex<HashSet<String>>,
    connect_delay: Mutex<HashMap<String, Duration>>,
    ping_delay: Mutex<HashMap<u64, Duration>>,
    alive: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

/// host 이름으로 도달 가능 여부와 연결 지연을 흉내내는 커넥터
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_unreachable(&self, host: &str) {
        self.state.unreachable.lock().insert(host.to_string());
    }

    pub(crate) fn set_connect_delay(&self, host: &str, delay: Duration) {
        self.state.connect_delay.lock().insert(host.to_string(), delay);
    }

    /// 해당 세션의 ping이 응답하기까지 걸리는 시간
    pub(crate) fn set_ping_delay(&self, connection_id: u64, delay: Duration) {
        self.state.ping_delay.lock().insert(connection_id, delay);
    }

    /// 세션을 죽은 상태로 만든다 (다음 ping 실패)
    pub(crate) fn kill(&self, connection_id: u64) {
        if let Some(flag) = self.state.alive.lock().get(&connection_id) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn opened_count(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        endpoint: &EndpointDescriptor,
        _connect_timeout: Duration,
    ) -> Result<Box<dyn PhysicalSession>> {
        let delay = self.state.connect_delay.lock().get(&endpoint.host).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.state.unreachable.lock().contains(&endpoint.host) {
            return Err(ClientError::ConnectError {
                endpoint: endpoint.to_string(),
                reason: format!("[Errno -2] Name or service not known: {}", endpoint.host),
            });
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        self.state.alive.lock().insert(id, Arc::clone(&alive));
        self.state.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockSession {
            id,
            host: endpoint.host.clone(),
            alive,
            state: Arc::clone(&self.state),
        }))
    }
}

pub(crate) struct MockSession {
    id: u64,
    pub(crate) host: String,
    alive: Arc<AtomicBool>,
    state: Arc<MockState>,
}

#[async_trait]
impl PhysicalSession for MockSession {
    fn connection_id(&self) -> u64 {
        self.id
    }

    async fn is_alive(&mut self) -> bool {
        let delay = self.state.ping_delay.lock().get(&self.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// 스폰된 태스크가 진행될 수 있도록 양보
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
