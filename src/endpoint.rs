//! 접속 대상 endpoint 정의

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// X Protocol 기본 포트
pub const DEFAULT_PORT: u16 = 33060;

/// priority 허용 범위
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 100;

/// 서버 하나에 대한 정적 접속 정보
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub host: String,
    pub port: u16,
    pub priority: Option<u8>,
}

impl EndpointDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        EndpointDescriptor {
            host: host.into(),
            port,
            priority: None,
        }
    }

    pub fn with_priority(host: impl Into<String>, port: u16, priority: u8) -> Self {
        EndpointDescriptor {
            host: host.into(),
            port,
            priority: Some(priority),
        }
    }

    /// 풀 레지스트리에서 쓰는 (host, port) 식별자
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ClientError::ConfigError(
                "endpoint host must not be empty".to_string(),
            ));
        }
        if let Some(priority) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                return Err(ClientError::ConfigError(format!(
                    "The priorities must be between {} and {}, got {} for {}",
                    MIN_PRIORITY, MAX_PRIORITY, priority, self
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// endpoint의 안정적인 식별자 (priority 제외)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
}

impl EndpointKey {
    /// 풀 ID 생성: "{host}_{port}_{n}"
    pub fn pool_id(&self, sequence: u64) -> String {
        format!("{}_{}_{}", self.host, self.port, sequence)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.host, self.port)
    }
}
