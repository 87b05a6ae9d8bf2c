//! 클라이언트/풀/라우터 에러 타입

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("Cannot connect to host: {reason}")]
    ConnectError { endpoint: String, reason: String },

    #[error("pool max size has been reached")]
    PoolExhausted { pool_id: String },

    #[error("풀 에러: {0}")]
    PoolError(String),

    #[error("{0}")]
    ConnectionError(FailoverReport),

    #[error("쿼리 에러: {0}")]
    QueryError(String),

    #[error("세션이 이미 닫혔습니다")]
    SessionClosed,

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl ClientError {
    /// 풀 용량 초과로 실패했는지 여부 (풀 단독 에러 또는 failover 집계 에러)
    pub fn is_pool_exhausted(&self) -> bool {
        match self {
            ClientError::PoolExhausted { .. } => true,
            ClientError::ConnectionError(report) => report.exhausted.is_some(),
            _ => false,
        }
    }

    /// 다음 후보 endpoint로 넘어가도 되는 에러인지 여부
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::ConnectError { .. })
    }
}

/// endpoint 하나에 대한 실패 기록
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub pool_id: String,
    pub message: String,
}

/// 모든 후보가 실패했을 때의 집계 보고서
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverReport {
    /// 후보 순서대로의 실패 기록
    pub failures: Vec<EndpointFailure>,
    /// 용량 초과로 failover가 중단된 풀 ID
    pub exhausted: Option<String>,
    /// 누적 connect_timeout 초과 여부
    pub deadline_exceeded: bool,
}

impl FailoverReport {
    pub fn push(&mut self, pool_id: impl Into<String>, message: impl Into<String>) {
        self.failures.push(EndpointFailure {
            pool_id: pool_id.into(),
            message: message.into(),
        });
    }
}

impl fmt::Display for FailoverReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Unable to connect to any of the target hosts: [")?;
        for failure in &self.failures {
            writeln!(f, "    pool: {} error: {}", failure.pool_id, failure.message)?;
        }
        if self.deadline_exceeded {
            writeln!(f, "    connect_timeout exceeded before all hosts were tried")?;
        }
        write!(f, "]")
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
