//! MySQL 제어 연결 관리
//!
//! 덤프 스트림이 아니라 현재 binlog 위치 조회, liveness 확인 같은
//! 일반 쿼리에만 사용한다.

use crate::error::{CdcError, Result};
use crate::position::LogPosition;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// 접속 대상 MySQL 서버
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    pub timeout: Duration,
}

impl Default for SourceEndpoint {
    fn default() -> Self {
        SourceEndpoint {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Display for SourceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl SourceEndpoint {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        SourceEndpoint {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn build_opts(&self) -> Opts {
        let builder = OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone());
        Opts::from(builder)
    }
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
    endpoint: SourceEndpoint,
}

impl MySqlConnection {
    pub async fn connect(endpoint: &SourceEndpoint) -> Result<Self> {
        let opts = endpoint.build_opts();
        let conn = tokio::time::timeout(endpoint.timeout, Conn::new(opts))
            .await
            .map_err(|_| CdcError::Timeout)?
            .map_err(|e| {
                CdcError::ConnectionError(format!("Failed to connect to {}: {}", endpoint, e))
            })?;

        debug!("Connected to MySQL at {}", endpoint);
        Ok(MySqlConnection {
            conn,
            endpoint: endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &SourceEndpoint {
        &self.endpoint
    }

    /// 현재 master binlog 위치 조회
    ///
    /// 8.4 부터는 SHOW MASTER STATUS 가 없으므로 새 구문을 먼저 시도한다.
    pub async fn master_position(&mut self) -> Result<LogPosition> {
        let rows: Vec<Row> = match self.conn.query("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(e) => {
                debug!("SHOW BINARY LOG STATUS failed, falling back: {}", e);
                self.conn.query("SHOW MASTER STATUS").await.map_err(|e| {
                    CdcError::QueryError(format!("Failed to query binlog status: {}", e))
                })?
            }
        };

        let row = rows.first().ok_or_else(|| {
            CdcError::QueryError("No binlog status available, is binary logging enabled?".to_string())
        })?;
        let file: String = row
            .get(0)
            .ok_or_else(|| CdcError::QueryError("Missing File column".to_string()))?;
        let position: u64 = row
            .get(1)
            .ok_or_else(|| CdcError::QueryError("Missing Position column".to_string()))?;

        Ok(LogPosition::new(file, position))
    }

    /// 변수 조회
    pub async fn get_variable(&mut self, name: &str) -> Result<Option<String>> {
        let query = format!("SHOW GLOBAL VARIABLES LIKE '{}'", name);
        let result: Vec<(String, String)> = self
            .conn
            .query(&query)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.first().map(|(_, v)| v.clone()))
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.conn
            .ping()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Ping to {} failed: {}", self.endpoint, e)))
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to disconnect: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_default() {
        let endpoint = SourceEndpoint::default();
        assert_eq!(endpoint.hostname, "localhost");
        assert_eq!(endpoint.port, 3306);
        assert_eq!(endpoint.to_string(), "localhost:3306");
    }

    #[test]
    fn test_endpoint_new() {
        let endpoint = SourceEndpoint::new("127.0.0.1", "canal").with_port(3307);
        assert_eq!(endpoint.hostname, "127.0.0.1");
        assert_eq!(endpoint.username, "canal");
        assert_eq!(endpoint.port, 3307);
    }

    #[tokio::test]
    #[ignore] // 실제 MySQL 연결 필요
    async fn test_master_position() {
        let endpoint = SourceEndpoint::new("localhost", "root");
        let mut conn = MySqlConnection::connect(&endpoint).await.unwrap();
        let position = conn.master_position().await.unwrap();
        assert!(position.position >= 4);
        conn.close().await.unwrap();
    }
}
