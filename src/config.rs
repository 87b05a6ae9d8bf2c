//! 클라이언트 및 풀 설정
//!
//! 설정은 세 가지 경로로 들어온다:
//! - 코드에서 직접 `ClientConfig`/`PoolConfig` 생성
//! - JSON 접속 설정 (`{"host": ..., "routers": [...]}`) + JSON 옵션 (`{"pooling": {...}}`)
//! - 접속 URI (`mysqlx://user:pwd@[(address=host:port, priority=90), ...]/schema`)

use crate::endpoint::{EndpointDescriptor, DEFAULT_PORT};
use crate::error::{ClientError, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// 기본 연결 제한 시간 (모든 후보 누적)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// 기본 풀 최대 크기
pub const DEFAULT_MAX_SIZE: usize = 25;

/// 풀 설정
///
/// `max_idle_time`, `queue_timeout`은 0이면 제한 없음.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub max_idle_time: Duration,
    pub queue_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            enabled: true,
            max_size: DEFAULT_MAX_SIZE,
            max_idle_time: Duration::ZERO,
            queue_timeout: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    pub fn new(max_size: usize) -> Self {
        PoolConfig {
            max_size,
            ..Default::default()
        }
    }

    /// 풀링 비활성화 설정
    pub fn disabled() -> Self {
        PoolConfig {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    pub fn with_queue_timeout(mut self, queue_timeout: Duration) -> Self {
        self.queue_timeout = queue_timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(ClientError::ConfigError(
                "max_size must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    /// JSON 옵션 문자열에서 풀 설정 추출: `{"pooling": {...}}`
    pub fn from_options_json(options: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(options)?;
        Self::from_options(&value)
    }

    /// 이미 파싱된 JSON 옵션에서 풀 설정 추출
    ///
    /// 알 수 없는 키와 잘못된 타입은 모두 `ConfigError`.
    pub fn from_options(options: &Value) -> Result<Self> {
        let options = options.as_object().ok_or_else(|| {
            ClientError::ConfigError("client options must be a JSON object".to_string())
        })?;

        if let Some(key) = options.keys().find(|k| k.as_str() != "pooling") {
            return Err(ClientError::ConfigError(format!(
                "Unrecognized client option: {}",
                key
            )));
        }

        let mut config = PoolConfig::default();
        let pooling = match options.get("pooling") {
            Some(pooling) => pooling.as_object().ok_or_else(|| {
                ClientError::ConfigError("pooling option must be a JSON object".to_string())
            })?,
            None => return Ok(config),
        };

        for (key, value) in pooling {
            match key.as_str() {
                "enabled" => {
                    config.enabled = value.as_bool().ok_or_else(|| {
                        ClientError::ConfigError(format!(
                            "enabled must be a boolean, got {}",
                            value
                        ))
                    })?;
                }
                "max_size" => {
                    config.max_size = match value.as_u64() {
                        Some(n) if !value.is_boolean() && n > 0 => n as usize,
                        _ => {
                            return Err(ClientError::ConfigError(format!(
                                "max_size must be a positive integer, got {}",
                                value
                            )))
                        }
                    };
                }
                "max_idle_time" => config.max_idle_time = millis_option(key, value)?,
                "queue_timeout" => config.queue_timeout = millis_option(key, value)?,
                other => {
                    return Err(ClientError::ConfigError(format!(
                        "Unrecognized pooling option: {}",
                        other
                    )))
                }
            }
        }

        config.validate()?;
        Ok(config)
    }
}

/// 0 이상의 정수 밀리초 값
fn millis_option(key: &str, value: &Value) -> Result<Duration> {
    value.as_u64().map(Duration::from_millis).ok_or_else(|| {
        ClientError::ConfigError(format!(
            "{} must be a non-negative integer (milliseconds), got {}",
            key, value
        ))
    })
}

/// 라우터 하나에 대한 JSON 설정
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    pub host: String,
    pub port: Option<u16>,
    pub priority: Option<u8>,
}

/// 접속 설정 (JSON 또는 URI에서 파싱)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub routers: Vec<RouterSettings>,
    /// 밀리초
    #[serde(default)]
    pub connect_timeout: Option<u64>,
}

impl ClientSettings {
    pub fn from_json(settings: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(settings)?;
        if let Some(routers) = value.get("routers").and_then(Value::as_array) {
            for priority in routers.iter().filter_map(|r| r.get("priority")) {
                match priority.as_u64() {
                    Some(p) if (1..=100).contains(&p) => {}
                    _ if priority.is_null() => {}
                    _ => {
                        return Err(ClientError::ConfigError(format!(
                            "The priorities must be between 1 and 100, got {}",
                            priority
                        )))
                    }
                }
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// `mysqlx://` URI 파싱
    pub fn from_uri(uri: &str) -> Result<Self> {
        let uri_re = Regex::new(
            r"^mysqlx://(?:(?P<user>[^:@/\[]*)(?::(?P<password>[^@]*))?@)?(?P<hosts>\[.*\]|[^/?\[]+)(?:/(?P<schema>[^?]*))?(?:\?(?P<query>.*))?$",
        )
        .map_err(|e| ClientError::ConfigError(format!("Invalid URI pattern: {}", e)))?;

        let caps = uri_re
            .captures(uri.trim())
            .ok_or_else(|| ClientError::ConfigError(format!("Invalid connection URI: {}", uri)))?;

        let mut settings = ClientSettings {
            user: caps.name("user").map(|m| m.as_str().to_string()),
            password: caps.name("password").map(|m| m.as_str().to_string()),
            schema: caps
                .name("schema")
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty()),
            ..Default::default()
        };

        let hosts = &caps["hosts"];
        if let Some(list) = hosts.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            settings.routers = parse_router_list(list)?;
        } else {
            let (host, port) = split_address(hosts)?;
            settings.host = Some(host);
            settings.port = port;
        }

        if let Some(query) = caps.name("query") {
            for pair in query.as_str().split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                match key.to_ascii_lowercase().as_str() {
                    "connect_timeout" => {
                        let ms = value.parse::<u64>().map_err(|_| {
                            ClientError::ConfigError(format!(
                                "connect_timeout must be a non-negative integer, got {:?}",
                                value
                            ))
                        })?;
                        settings.connect_timeout = Some(ms);
                    }
                    other => debug!("Ignoring URI option {}", other),
                }
            }
        }

        Ok(settings)
    }

    /// 후보 endpoint 목록
    ///
    /// 최상위 host는 priority 없는 라우터로 뒤에 추가된다.
    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        let mut endpoints: Vec<EndpointDescriptor> = self
            .routers
            .iter()
            .map(|r| EndpointDescriptor {
                host: r.host.clone(),
                port: r.port.unwrap_or(DEFAULT_PORT),
                priority: r.priority,
            })
            .collect();

        if let Some(ref host) = self.host {
            if !host.is_empty() {
                endpoints.push(EndpointDescriptor::new(
                    host.clone(),
                    self.port.unwrap_or(DEFAULT_PORT),
                ));
            }
        }

        if endpoints.is_empty() {
            endpoints.push(EndpointDescriptor::new("localhost", DEFAULT_PORT));
        }
        endpoints
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }
}

/// `(address=h:p, priority=n), h2:p2` 형식의 라우터 목록 파싱
fn parse_router_list(list: &str) -> Result<Vec<RouterSettings>> {
    let entry_re = Regex::new(r"\((?P<group>[^)]*)\)|(?P<plain>[^,\s()]+)")
        .map_err(|e| ClientError::ConfigError(format!("Invalid URI pattern: {}", e)))?;

    let mut routers = Vec::new();
    for caps in entry_re.captures_iter(list) {
        if let Some(plain) = caps.name("plain") {
            let (host, port) = split_address(plain.as_str())?;
            routers.push(RouterSettings {
                host,
                port,
                priority: None,
            });
            continue;
        }

        let group = caps.name("group").map(|m| m.as_str()).unwrap_or_default();
        let mut address = None;
        let mut priority = None;
        for part in group.split(',') {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ClientError::ConfigError(format!("Invalid router entry: ({})", group))
            })?;
            match key.trim().to_ascii_lowercase().as_str() {
                "address" => address = Some(split_address(value.trim())?),
                "priority" => {
                    let value = value.trim();
                    priority = Some(value.parse::<u8>().map_err(|_| {
                        ClientError::ConfigError(format!(
                            "The priorities must be between 1 and 100, got {}",
                            value
                        ))
                    })?);
                }
                other => {
                    return Err(ClientError::ConfigError(format!(
                        "Unrecognized router attribute: {}",
                        other
                    )))
                }
            }
        }

        let (host, port) = address.ok_or_else(|| {
            ClientError::ConfigError(format!("Router entry without address: ({})", group))
        })?;
        routers.push(RouterSettings {
            host,
            port,
            priority,
        });
    }

    if routers.is_empty() {
        return Err(ClientError::ConfigError(
            "Empty router list in URI".to_string(),
        ));
    }
    Ok(routers)
}

/// `host[:port]` 분리 (`[::1]:33060` 형식의 IPv6 포함)
fn split_address(address: &str) -> Result<(String, Option<u16>)> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| ClientError::ConfigError(format!("Invalid port in address: {}", address)))
    };

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            ClientError::ConfigError(format!("Invalid IPv6 address: {}", address))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(port)?))),
        None => Ok((address.to_string(), None)),
    }
}

/// 클라이언트 설정
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoints: Vec<EndpointDescriptor>,
    /// 모든 후보에 걸친 누적 연결 제한 시간 (0이면 제한 없음)
    pub connect_timeout: Duration,
    pub pooling: PoolConfig,
}

impl ClientConfig {
    pub fn new(endpoints: Vec<EndpointDescriptor>) -> Self {
        ClientConfig {
            endpoints,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pooling: PoolConfig::default(),
        }
    }

    pub fn with_pooling(mut self, pooling: PoolConfig) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn from_settings(settings: &ClientSettings, pooling: PoolConfig) -> Self {
        ClientConfig {
            endpoints: settings.endpoints(),
            connect_timeout: settings.connect_timeout(),
            pooling,
        }
    }
}
