//! 라우터 - 후보 endpoint 정렬 및 failover
//!
//! 정렬 규칙:
//! - 모든 endpoint에 priority가 있으면 내림차순, 동점은 호출마다 무작위
//! - 아무도 priority가 없으면 호출마다 새로 섞은 순서
//! - 섞여 있으면 설정 에러
//!
//! 연결 실패(`ConnectError`)는 다음 후보로 넘어가고, 풀 용량 초과는 바로 중단한다.

use crate::endpoint::{EndpointDescriptor, EndpointKey};
use crate::error::{ClientError, FailoverReport, Result};
use crate::pool::PoolRegistry;
use crate::session::LeasedSession;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 연결 시도 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Connected,
    Unreachable(String),
    Exhausted,
}

/// endpoint별 마지막 연결 시도 기록 (진단용)
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub endpoint: String,
    pub pool_id: String,
    pub at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "endpoint": self.endpoint,
            "pool": self.pool_id,
            "at": self.at.to_rfc3339(),
            "outcome": self.outcome,
        })
    }
}

pub struct Router {
    descriptors: Vec<EndpointDescriptor>,
    prioritized: bool,
    attempts: RwLock<HashMap<EndpointKey, AttemptRecord>>,
}

impl Router {
    pub fn new(descriptors: Vec<EndpointDescriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(ClientError::ConfigError(
                "at least one endpoint is required".to_string(),
            ));
        }
        for descriptor in &descriptors {
            descriptor.validate()?;
        }

        let with_priority = descriptors.iter().filter(|d| d.priority.is_some()).count();
        if with_priority > 0 && with_priority < descriptors.len() {
            return Err(ClientError::ConfigError(
                "You must either assign no priority to any of the routers or give a priority for every router"
                    .to_string(),
            ));
        }

        Ok(Router {
            prioritized: with_priority > 0,
            descriptors,
            attempts: RwLock::new(HashMap::new()),
        })
    }

    pub fn descriptors(&self) -> &[EndpointDescriptor] {
        &self.descriptors
    }

    pub fn is_prioritized(&self) -> bool {
        self.prioritized
    }

    /// 이번 호출의 시도 순서
    pub fn select_order(&self) -> Vec<EndpointDescriptor> {
        let mut order = self.descriptors.clone();
        order.shuffle(&mut rand::thread_rng());
        if self.prioritized {
            // 안정 정렬이라 동점끼리는 섞인 순서가 유지된다
            order.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        order
    }

    /// 후보를 순서대로 시도해서 세션 하나를 얻는다
    ///
    /// `connect_timeout`은 모든 후보에 걸친 누적 제한 시간 (0이면 제한 없음).
    pub async fn get_session(
        &self,
        pools: &PoolRegistry,
        connect_timeout: Duration,
    ) -> Result<LeasedSession> {
        let deadline = (!connect_timeout.is_zero()).then(|| Instant::now() + connect_timeout);
        let mut report = FailoverReport::default();

        for endpoint in self.select_order() {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!("connect_timeout exceeded, skipping remaining hosts");
                        report.deadline_exceeded = true;
                        break;
                    }
                    deadline - now
                }
                None => Duration::ZERO,
            };

            debug!("Trying {}", endpoint);
            match pools.lease(&endpoint, remaining).await {
                Ok(lease) => {
                    let pool_id = pools.label(&endpoint);
                    self.record(&endpoint, &pool_id, AttemptOutcome::Connected);
                    info!("Got session on {} (pool {})", endpoint, pool_id);
                    return Ok(lease);
                }
                Err(err) if err.is_retryable() => {
                    let pool_id = pools.label(&endpoint);
                    warn!("Failed to connect to {}: {}", endpoint, err);
                    self.record(&endpoint, &pool_id, AttemptOutcome::Unreachable(err.to_string()));
                    report.push(pool_id, err.to_string());
                }
                Err(err @ ClientError::PoolExhausted { .. }) => {
                    let pool_id = pools.label(&endpoint);
                    warn!("Pool {} is exhausted, stopping failover", pool_id);
                    self.record(&endpoint, &pool_id, AttemptOutcome::Exhausted);
                    report.push(pool_id.clone(), err.to_string());
                    report.exhausted = Some(pool_id);
                    return Err(ClientError::ConnectionError(report));
                }
                Err(err) => return Err(err),
            }
        }

        Err(ClientError::ConnectionError(report))
    }

    fn record(&self, endpoint: &EndpointDescriptor, pool_id: &str, outcome: AttemptOutcome) {
        self.attempts.write().insert(
            endpoint.key(),
            AttemptRecord {
                endpoint: endpoint.to_string(),
                pool_id: pool_id.to_string(),
                at: Utc::now(),
                outcome,
            },
        );
    }

    pub fn last_attempt(&self, endpoint: &EndpointDescriptor) -> Option<AttemptRecord> {
        self.attempts.read().get(&endpoint.key()).cloned()
    }

    /// 후보 선언 순서대로의 마지막 시도 기록
    pub fn last_attempts(&self) -> Vec<AttemptRecord> {
        let attempts = self.attempts.read();
        self.descriptors
            .iter()
            .filter_map(|d| attempts.get(&d.key()).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::test_support::{MockConnector, MockSession};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn registry(connector: &MockConnector, config: PoolConfig) -> PoolRegistry {
        PoolRegistry::new(config, Arc::new(connector.clone()))
    }

    #[test]
    fn test_mixed_priorities_rejected() {
        let err = Router::new(vec![
            EndpointDescriptor::with_priority("a", 33060, 100),
            EndpointDescriptor::new("b", 33060),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, ClientError::ConfigError(_)));

        assert!(Router::new(vec![
            EndpointDescriptor::new("unreachable_host", 33060),
            EndpointDescriptor::new("127.0.0.1", 33060),
        ])
        .is_ok());
        assert!(Router::new(Vec::new()).is_err());
        assert!(Router::new(vec![EndpointDescriptor::with_priority("a", 33060, 0)]).is_err());
    }

    #[test]
    fn test_select_order_by_priority() {
        let router = Router::new(vec![
            EndpointDescriptor::with_priority("a", 33060, 50),
            EndpointDescriptor::with_priority("b", 33060, 100),
            EndpointDescriptor::with_priority("c", 33060, 70),
        ])
        .unwrap();

        for _ in 0..20 {
            let hosts: Vec<String> = router.select_order().into_iter().map(|d| d.host).collect();
            assert_eq!(hosts, vec!["b", "c", "a"]);
        }
    }

    #[test]
    fn test_priority_ties_are_shuffled_per_call() {
        let router = Router::new(vec![
            EndpointDescriptor::with_priority("a", 33060, 100),
            EndpointDescriptor::with_priority("b", 33060, 100),
            EndpointDescriptor::with_priority("c", 33060, 10),
        ])
        .unwrap();

        let mut firsts = HashSet::new();
        for _ in 0..200 {
            let order = router.select_order();
            assert_eq!(order[2].host, "c");
            firsts.insert(order[0].host.clone());
        }
        assert_eq!(firsts.len(), 2);
    }

    #[test]
    fn test_unprioritized_order_is_a_permutation() {
        let router = Router::new(vec![
            EndpointDescriptor::new("a", 33060),
            EndpointDescriptor::new("b", 33060),
            EndpointDescriptor::new("c", 33060),
        ])
        .unwrap();

        let mut firsts = HashSet::new();
        for _ in 0..200 {
            let mut hosts: Vec<String> = router.select_order().into_iter().map(|d| d.host).collect();
            firsts.insert(hosts[0].clone());
            hosts.sort();
            assert_eq!(hosts, vec!["a", "b", "c"]);
        }
        assert_eq!(firsts.len(), 3);
    }

    #[tokio::test]
    async fn test_failover_to_next_priority() {
        let connector = MockConnector::new();
        connector.set_unreachable("a");
        let pools = registry(&connector, PoolConfig::default());
        let router = Router::new(vec![
            EndpointDescriptor::with_priority("a", 33060, 100),
            EndpointDescriptor::with_priority("b", 33060, 90),
        ])
        .unwrap();

        let mut lease = router.get_session(&pools, Duration::ZERO).await.unwrap();
        assert_eq!(lease.endpoint().host, "b");
        assert_eq!(lease.downcast_mut::<MockSession>().unwrap().host, "b");

        let attempts = router.last_attempts();
        assert_eq!(attempts.len(), 2);
        assert!(matches!(attempts[0].outcome, AttemptOutcome::Unreachable(_)));
        assert_eq!(attempts[1].outcome, AttemptOutcome::Connected);
        assert_eq!(attempts[1].to_json()["outcome"]["outcome"], "connected");
    }

    #[tokio::test]
    async fn test_all_unreachable_aggregates_in_order() {
        let connector = MockConnector::new();
        connector.set_unreachable("a");
        connector.set_unreachable("b");
        let pools = registry(&connector, PoolConfig::default());
        let router = Router::new(vec![
            EndpointDescriptor::with_priority("b", 33060, 10),
            EndpointDescriptor::with_priority("a", 33060, 90),
        ])
        .unwrap();

        let err = router.get_session(&pools, Duration::ZERO).await.unwrap_err();
        let ClientError::ConnectionError(ref report) = err else {
            panic!("unexpected error: {:?}", err);
        };
        assert!(report.exhausted.is_none());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].pool_id, "a_33060_1");
        assert_eq!(report.failures[1].pool_id, "b_33060_2");
        assert_eq!(
            err.to_string(),
            "Unable to connect to any of the target hosts: [\n    \
             pool: a_33060_1 error: Cannot connect to host: [Errno -2] Name or service not known: a\n    \
             pool: b_33060_2 error: Cannot connect to host: [Errno -2] Name or service not known: b\n]"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_stops_failover() {
        let connector = MockConnector::new();
        let pools = registry(
            &connector,
            PoolConfig::new(1).with_queue_timeout(Duration::from_millis(10)),
        );
        let router = Router::new(vec![
            EndpointDescriptor::with_priority("a", 33060, 100),
            EndpointDescriptor::with_priority("b", 33060, 90),
        ])
        .unwrap();

        let _held = router.get_session(&pools, Duration::ZERO).await.unwrap();
        let err = router.get_session(&pools, Duration::ZERO).await.unwrap_err();

        assert!(err.is_pool_exhausted());
        assert!(err.to_string().contains("pool: a_33060_1 error: pool max size has been reached"));
        assert_eq!(connector.opened_count(), 1);
        assert_eq!(pools.status().len(), 1);
        assert!(router.last_attempt(&EndpointDescriptor::new("b", 33060)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_cumulative() {
        let connector = MockConnector::new();
        connector.set_unreachable("a");
        connector.set_connect_delay("a", Duration::from_millis(300));
        connector.set_connect_delay("b", Duration::from_millis(300));
        let pools = registry(&connector, PoolConfig::default());
        let router = Router::new(vec![
            EndpointDescriptor::with_priority("a", 33060, 100),
            EndpointDescriptor::with_priority("b", 33060, 90),
            EndpointDescriptor::with_priority("c", 33060, 80),
        ])
        .unwrap();

        let started = Instant::now();
        let err = router
            .get_session(&pools, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_millis(500));

        let ClientError::ConnectionError(report) = err else {
            panic!("expected aggregate error");
        };
        assert!(report.deadline_exceeded);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[1].message.contains("timed out after 200ms"));
        assert!(router.last_attempt(&EndpointDescriptor::new("c", 33060)).is_none());
        assert_eq!(connector.opened_count(), 0);
    }
}
