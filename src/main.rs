/// MySQL 세션 풀 사용 예제
///
/// 이 프로그램은 라우터 목록에서 세션을 얻어 연결 ID를 조회하고 풀 상태를 출력합니다.
use mysqlx_pool::{connect_client, MySqlSession};
use std::env;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let uri = env::var("MYSQLX_URI").unwrap_or_else(|_| {
        "mysqlx://root@[(address=127.0.0.1:3306, priority=100), (address=localhost:3306, priority=50)]"
            .to_string()
    });
    let options = env::var("MYSQLX_OPTIONS").ok();

    let client = connect_client(&uri, options.as_deref())?;
    info!("Connecting via {} endpoint(s)", client.router().descriptors().len());

    // 같은 세션이 재사용되는지 두 번 조회
    for round in 1..=2 {
        let mut lease = match client.get_session().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failed to get session: {}", e);
                client.close().await;
                return Err(e.into());
            }
        };

        let connection_id = lease
            .downcast_mut::<MySqlSession>()?
            .query_connection_id()
            .await?;
        info!(
            "Round {}: {} (pool {:?}) connection id {}",
            round,
            lease.endpoint(),
            lease.pool_id(),
            connection_id
        );
        lease.close().await?;
    }

    for attempt in client.router().last_attempts() {
        info!("Last attempt: {}", attempt.to_json());
    }
    for status in client.pool_status() {
        info!("Pool status: {}", serde_json::to_string(&status)?);
    }

    client.close().await;
    Ok(())
}
