//! endpoint별 세션 풀
//!
//! - 유휴 세션은 LIFO 스택으로 관리 (가장 최근에 반환된 세션부터 재사용)
//! - 용량이 찼을 때의 대기자는 oneshot 채널 큐로 관리 (FIFO)
//! - 모든 상태 변경은 풀 하나당 하나의 Mutex 아래에서 일어나고,
//!   네트워크 작업(ping, reset, connect, close)은 락 밖에서 수행
//!
//! 불변식: `active + idle <= max_size`

use crate::config::PoolConfig;
use crate::endpoint::{EndpointDescriptor, EndpointKey};
use crate::error::{ClientError, Result};
use crate::session::{Connector, LeasedSession, PhysicalSession};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 대기자에게 넘겨주는 것: 반환된 세션 또는 새로 만들 수 있는 빈 슬롯
enum Grant {
    Session(Box<dyn PhysicalSession>),
    Slot,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

struct IdleEntry {
    session: Box<dyn PhysicalSession>,
    released_at: Instant,
}

#[derive(Default)]
struct PoolState {
    /// LIFO
    idle: Vec<IdleEntry>,
    /// 대여 중이거나 검사/생성 중인 세션 수
    active: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    closed: bool,
}

enum Next {
    Check(IdleEntry),
    Create,
    Wait(u64, oneshot::Receiver<Grant>),
}

/// `active`에 잡혀 있는 슬롯 하나
///
/// 세션을 호출자에게 넘기지 못한 채 drop되면 (에러, 취소) 슬롯을 비운다.
struct SlotReservation<'a> {
    pool: Option<&'a Pool>,
}

impl<'a> SlotReservation<'a> {
    fn new(pool: &'a Pool) -> Self {
        SlotReservation { pool: Some(pool) }
    }

    /// 슬롯이 세션과 함께 넘어갔다
    fn disarm(mut self) {
        self.pool = None;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.free_slot();
        }
    }
}

/// 대기열의 자리
///
/// grant를 받기 전에 drop되면 큐에서 빠진다. 이미 전달된 grant가 있으면 다음 대기자나 풀로 넘긴다.
struct QueuedWaiter<'a> {
    pool: &'a Pool,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    received: bool,
}

impl<'a> QueuedWaiter<'a> {
    fn new(pool: &'a Pool, id: u64, rx: oneshot::Receiver<Grant>) -> Self {
        QueuedWaiter {
            pool,
            id,
            rx,
            received: false,
        }
    }

    async fn recv(&mut self) -> std::result::Result<Grant, oneshot::error::RecvError> {
        let grant = (&mut self.rx).await;
        self.received = true;
        grant
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.received {
            return;
        }

        let leftover = {
            let mut state = self.pool.state.lock();
            match state.waiters.iter().position(|w| w.id == self.id) {
                Some(pos) => {
                    state.waiters.remove(pos);
                    None
                }
                None => match self.rx.try_recv() {
                    Ok(grant) => self.pool.dispatch_locked(&mut state, grant),
                    Err(_) => None,
                },
            }
        };
        if let Some(session) = leftover {
            self.pool.discard(session);
        }
    }
}

/// 풀 누적 통계
#[derive(Debug, Default)]
struct AtomicPoolStats {
    created: AtomicU64,
    reused: AtomicU64,
    closed: AtomicU64,
    evicted: AtomicU64,
    exhausted: AtomicU64,
}

impl AtomicPoolStats {
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// 풀 상태 스냅샷
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool_id: String,
    pub endpoint: String,
    pub max_size: usize,
    pub active: usize,
    pub idle: usize,
    pub waiters: usize,
    pub closed: bool,
    pub sessions_created: u64,
    pub sessions_reused: u64,
    pub sessions_closed: u64,
    pub sessions_evicted: u64,
    pub exhausted_count: u64,
}

/// endpoint 하나에 대한 세션 풀
pub struct Pool {
    id: String,
    endpoint: EndpointDescriptor,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    stats: AtomicPoolStats,
}

impl Pool {
    pub fn new(
        id: String,
        endpoint: EndpointDescriptor,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Pool {
            id,
            endpoint,
            config,
            connector,
            state: Mutex::new(PoolState::default()),
            stats: AtomicPoolStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 세션을 대여하고 풀로 돌아오는 핸들로 감싼다
    pub async fn get(self: &Arc<Self>, connect_timeout: Duration) -> Result<LeasedSession> {
        let session = self.acquire(connect_timeout).await?;
        Ok(LeasedSession::pooled(
            session,
            Arc::clone(self),
            self.endpoint.clone(),
        ))
    }

    /// 세션 획득
    ///
    /// 1. 유휴 세션이 있으면 LIFO로 꺼내 상태 확인
    /// 2. 용량이 남아 있으면 커넥터로 새 세션 생성
    /// 3. 가득 찼으면 `queue_timeout`까지 대기 (0이면 무한 대기)
    ///
    /// 도중에 취소되어도 예약한 슬롯과 이미 전달된 세션은 풀로 돌아간다.
    pub async fn acquire(&self, connect_timeout: Duration) -> Result<Box<dyn PhysicalSession>> {
        self.sweep_idle().await;

        let next = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.closed_error());
            }

            if let Some(entry) = state.idle.pop() {
                state.active += 1;
                Next::Check(entry)
            } else if state.active + state.idle.len() < self.config.max_size {
                state.active += 1;
                Next::Create
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter { id, tx });
                Next::Wait(id, rx)
            }
        };

        match next {
            Next::Check(entry) => {
                self.checkout(SlotReservation::new(self), entry, connect_timeout)
                    .await
            }
            Next::Create => self.create(SlotReservation::new(self), connect_timeout).await,
            Next::Wait(id, rx) => self.wait(QueuedWaiter::new(self, id, rx), connect_timeout).await,
        }
    }

    /// 예약된 슬롯으로 유휴 세션을 검사, 쓸 수 없으면 다음 유휴 세션 또는 새 세션
    ///
    /// ping도 `connect_timeout` 안에서 끝나야 한다.
    async fn checkout(
        &self,
        slot: SlotReservation<'_>,
        mut entry: IdleEntry,
        connect_timeout: Duration,
    ) -> Result<Box<dyn PhysicalSession>> {
        let deadline = (!connect_timeout.is_zero()).then(|| Instant::now() + connect_timeout);

        loop {
            let alive = if self.is_stale(entry.released_at) {
                Some(false)
            } else {
                self.ping(&mut entry.session, deadline).await
            };

            match alive {
                Some(true) => {
                    AtomicPoolStats::record(&self.stats.reused);
                    debug!(
                        "Reusing session {} from pool {}",
                        entry.session.connection_id(),
                        self.id
                    );
                    slot.disarm();
                    return Ok(entry.session);
                }
                Some(false) => {
                    debug!(
                        "Discarding idle session {} from pool {}",
                        entry.session.connection_id(),
                        self.id
                    );
                    self.discard(entry.session);
                }
                None => {
                    warn!(
                        "Ping on idle session {} in pool {} timed out",
                        entry.session.connection_id(),
                        self.id
                    );
                    self.discard(entry.session);
                    return Err(timed_out(&self.endpoint, connect_timeout));
                }
            }

            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    None
                } else {
                    Some(state.idle.pop())
                }
            };

            match next {
                Some(Some(idle)) => entry = idle,
                Some(None) => {
                    let remaining = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return Err(timed_out(&self.endpoint, connect_timeout));
                            }
                            remaining
                        }
                        None => Duration::ZERO,
                    };
                    return self.create(slot, remaining).await;
                }
                None => return Err(self.closed_error()),
            }
        }
    }

    /// 유휴 세션 ping. 제한 시간 안에 답이 없으면 None.
    async fn ping(
        &self,
        session: &mut Box<dyn PhysicalSession>,
        deadline: Option<Instant>,
    ) -> Option<bool> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, session.is_alive())
                .await
                .ok(),
            None => Some(session.is_alive().await),
        }
    }

    /// 예약된 슬롯에 새 세션 생성
    async fn create(
        &self,
        slot: SlotReservation<'_>,
        connect_timeout: Duration,
    ) -> Result<Box<dyn PhysicalSession>> {
        let mut session = open_session(&*self.connector, &self.endpoint, connect_timeout).await?;

        let closed = self.state.lock().closed;
        if closed {
            session.close().await;
            return Err(self.closed_error());
        }

        AtomicPoolStats::record(&self.stats.created);
        info!(
            "Opened session {} to {} (pool {})",
            session.connection_id(),
            self.endpoint,
            self.id
        );
        slot.disarm();
        Ok(session)
    }

    /// 대기열에서 세션 또는 슬롯을 기다림
    async fn wait(
        &self,
        mut waiter: QueuedWaiter<'_>,
        connect_timeout: Duration,
    ) -> Result<Box<dyn PhysicalSession>> {
        debug!("Pool {} is full, queueing request #{}", self.id, waiter.id);

        let received = if self.config.queue_timeout.is_zero() {
            Some(waiter.recv().await)
        } else {
            tokio::time::timeout(self.config.queue_timeout, waiter.recv())
                .await
                .ok()
        };

        match received {
            Some(Ok(Grant::Session(session))) => {
                AtomicPoolStats::record(&self.stats.reused);
                debug!(
                    "Request #{} received session {} from pool {}",
                    waiter.id,
                    session.connection_id(),
                    self.id
                );
                Ok(session)
            }
            Some(Ok(Grant::Slot)) => self.create(SlotReservation::new(self), connect_timeout).await,
            // 풀이 닫히면서 대기자 큐가 비워짐
            Some(Err(_)) => Err(self.closed_error()),
            None => {
                drop(waiter);
                AtomicPoolStats::record(&self.stats.exhausted);
                warn!(
                    "Pool {} exhausted after waiting {}ms",
                    self.id,
                    self.config.queue_timeout.as_millis()
                );
                Err(ClientError::PoolExhausted {
                    pool_id: self.id.clone(),
                })
            }
        }
    }

    /// 세션 반환
    ///
    /// 살아있으면 첫 번째 대기자에게 넘기거나 유휴 스택에 넣는다.
    /// 죽었거나 풀이 닫혔으면 세션을 닫고 슬롯을 비운다.
    pub async fn release(&self, mut session: Box<dyn PhysicalSession>) {
        let slot = SlotReservation::new(self);
        let closed = self.state.lock().closed;
        let healthy = !closed && session.reset().await.is_ok() && session.is_alive().await;

        if !healthy {
            debug!(
                "Closing session {} instead of returning it to pool {}",
                session.connection_id(),
                self.id
            );
            session.close().await;
            AtomicPoolStats::record(&self.stats.closed);
            return;
        }

        slot.disarm();
        let leftover = {
            let mut state = self.state.lock();
            self.dispatch_locked(&mut state, Grant::Session(session))
        };
        if let Some(mut session) = leftover {
            session.close().await;
            AtomicPoolStats::record(&self.stats.closed);
        }
    }

    /// 런타임 밖에서 drop된 세션의 슬롯 회수 (세션은 닫지 못하고 버린다)
    pub(crate) fn forget(&self, session: Box<dyn PhysicalSession>) {
        drop(session);
        AtomicPoolStats::record(&self.stats.closed);
        self.free_slot();
    }

    /// 쓸 수 없는 세션을 백그라운드에서 닫는다
    fn discard(&self, mut session: Box<dyn PhysicalSession>) {
        AtomicPoolStats::record(&self.stats.closed);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                session.close().await;
            });
        }
    }

    fn free_slot(&self) {
        let mut state = self.state.lock();
        // Slot은 세션을 돌려주지 않는다
        let _ = self.dispatch_locked(&mut state, Grant::Slot);
    }

    /// 살아있는 첫 번째 대기자에게 grant 전달, 대기자가 없으면 풀에 반영
    ///
    /// 풀이 닫혀서 보관할 수 없는 세션은 호출자가 닫도록 돌려준다.
    fn dispatch_locked(
        &self,
        state: &mut PoolState,
        mut grant: Grant,
    ) -> Option<Box<dyn PhysicalSession>> {
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }

        state.active = state.active.saturating_sub(1);
        match grant {
            Grant::Session(session) if state.closed => Some(session),
            Grant::Session(session) => {
                state.idle.push(IdleEntry {
                    session,
                    released_at: Instant::now(),
                });
                None
            }
            Grant::Slot => None,
        }
    }

    fn is_stale(&self, released_at: Instant) -> bool {
        !self.config.max_idle_time.is_zero() && released_at.elapsed() > self.config.max_idle_time
    }

    /// `max_idle_time`을 넘긴 유휴 세션 정리. 정리한 개수 반환.
    pub async fn sweep_idle(&self) -> usize {
        if self.config.max_idle_time.is_zero() {
            return 0;
        }

        let stale: Vec<IdleEntry> = {
            let mut state = self.state.lock();
            let (stale, fresh): (Vec<IdleEntry>, Vec<IdleEntry>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|entry| self.is_stale(entry.released_at));
            state.idle = fresh;
            stale
        };

        let count = stale.len();
        for mut entry in stale {
            debug!(
                "Evicting idle session {} from pool {}",
                entry.session.connection_id(),
                self.id
            );
            entry.session.close().await;
            AtomicPoolStats::record(&self.stats.evicted);
            AtomicPoolStats::record(&self.stats.closed);
        }
        count
    }

    /// 풀 종료
    ///
    /// 유휴 세션은 바로 닫히고, 대기자는 `PoolError`를 받는다.
    /// 대여 중인 세션은 반환될 때 닫힌다.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        drop(waiters);

        let count = idle.len();
        for mut entry in idle {
            entry.session.close().await;
            AtomicPoolStats::record(&self.stats.closed);
        }
        info!("Pool {} closed ({} idle sessions closed)", self.id, count);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            pool_id: self.id.clone(),
            endpoint: self.endpoint.to_string(),
            max_size: self.config.max_size,
            active: state.active,
            idle: state.idle.len(),
            waiters: state.waiters.len(),
            closed: state.closed,
            sessions_created: self.stats.created.load(Ordering::Relaxed),
            sessions_reused: self.stats.reused.load(Ordering::Relaxed),
            sessions_closed: self.stats.closed.load(Ordering::Relaxed),
            sessions_evicted: self.stats.evicted.load(Ordering::Relaxed),
            exhausted_count: self.stats.exhausted.load(Ordering::Relaxed),
        }
    }

    fn closed_error(&self) -> ClientError {
        ClientError::PoolError(format!("pool {} is closed", self.id))
    }
}

fn timed_out(endpoint: &EndpointDescriptor, connect_timeout: Duration) -> ClientError {
    ClientError::ConnectError {
        endpoint: endpoint.to_string(),
        reason: format!(
            "connection attempt timed out after {}ms",
            connect_timeout.as_millis()
        ),
    }
}

/// 커넥터 호출에 제한 시간을 걸고, 모든 실패를 `ConnectError`로 정규화
async fn open_session(
    connector: &dyn Connector,
    endpoint: &EndpointDescriptor,
    connect_timeout: Duration,
) -> Result<Box<dyn PhysicalSession>> {
    let opened = if connect_timeout.is_zero() {
        connector.open(endpoint, connect_timeout).await
    } else {
        match tokio::time::timeout(connect_timeout, connector.open(endpoint, connect_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(endpoint, connect_timeout)),
        }
    };

    opened.map_err(|e| match e {
        e @ ClientError::ConnectError { .. } => e,
        other => ClientError::ConnectError {
            endpoint: endpoint.to_string(),
            reason: other.to_string(),
        },
    })
}

/// 클라이언트가 소유하는 endpoint → 풀 맵
///
/// 풀은 처음 접속을 시도할 때 만들어지고 클라이언트가 닫힐 때까지 유지된다.
pub struct PoolRegistry {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    pools: Mutex<HashMap<EndpointKey, Arc<Pool>>>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl PoolRegistry {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        PoolRegistry {
            config,
            connector,
            pools: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// endpoint의 풀 (없으면 생성)
    pub fn pool_for(&self, endpoint: &EndpointDescriptor) -> Result<Arc<Pool>> {
        let key = endpoint.key();
        // closed는 pools 락 아래에서만 바뀐다
        let mut pools = self.pools.lock();
        if self.is_closed() {
            return Err(ClientError::PoolError("client is closed".to_string()));
        }

        let pool = pools.entry(key.clone()).or_insert_with(|| {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let id = key.pool_id(sequence);
            debug!("Creating pool {} for {}", id, endpoint);
            Arc::new(Pool::new(
                id,
                endpoint.clone(),
                self.config.clone(),
                Arc::clone(&self.connector),
            ))
        });
        Ok(Arc::clone(pool))
    }

    /// 에러 보고용 이름: 풀 ID, 풀이 없으면 `host_port`
    pub fn label(&self, endpoint: &EndpointDescriptor) -> String {
        let key = endpoint.key();
        match self.pools.lock().get(&key) {
            Some(pool) => pool.id().to_string(),
            None => key.to_string(),
        }
    }

    /// endpoint 하나에서 세션 대여. 풀링이 꺼져 있으면 풀을 거치지 않는다.
    pub async fn lease(
        &self,
        endpoint: &EndpointDescriptor,
        connect_timeout: Duration,
    ) -> Result<LeasedSession> {
        if !self.config.enabled {
            if self.is_closed() {
                return Err(ClientError::PoolError("client is closed".to_string()));
            }
            let session = open_session(&*self.connector, endpoint, connect_timeout).await?;
            return Ok(LeasedSession::unpooled(session, endpoint.clone()));
        }

        let pool = self.pool_for(endpoint)?;
        pool.get(connect_timeout).await
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        let mut status: Vec<PoolStatus> = self.pools.lock().values().map(|p| p.status()).collect();
        status.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        status
    }

    pub async fn sweep_idle(&self) -> usize {
        let pools: Vec<Arc<Pool>> = self.pools.lock().values().cloned().collect();
        let mut evicted = 0;
        for pool in pools {
            evicted += pool.sweep_idle().await;
        }
        evicted
    }

    /// 모든 풀 종료. 두 번째 호출부터는 아무 일도 하지 않는다.
    pub async fn close(&self) {
        let pools: Vec<Arc<Pool>> = {
            let pools = self.pools.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            pools.values().cloned().collect()
        };
        for pool in pools {
            pool.close().await;
        }
    }
}
