//! MySQL 세션 풀 + 라우터 failover
//!
//! 여러 후보 서버(endpoint)에 대해 세션을 재사용하고, 접속에 실패하면 다음 후보로 넘어간다.
//! 주요 기능:
//! - endpoint별 제한 크기 풀 (LIFO 재사용, FIFO 대기열, 유휴 세션 정리)
//! - priority 기반 후보 정렬 및 failover
//! - JSON/URI 접속 설정 파싱
//! - mysql_async 커넥터

pub mod client;
pub mod config;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod router;
pub mod session;

#[cfg(test)]
mod test_support;

pub use client::Client;
pub use config::{ClientConfig, ClientSettings, PoolConfig};
pub use connector::{connect_client, connect_client_from_json, Credentials, MySqlConnector, MySqlSession};
pub use endpoint::EndpointDescriptor;
pub use error::{ClientError, FailoverReport, Result};
pub use pool::{PoolRegistry, PoolStatus};
pub use router::{AttemptOutcome, AttemptRecord, Router};
pub use session::{Connector, LeasedSession, PhysicalSession};
