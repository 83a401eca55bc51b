//! 파이프라인 설정

use crate::buffer::{DEFAULT_GROWTH_FACTOR, DEFAULT_INITIAL_CAPACITY};
use crate::connection::SourceEndpoint;
use crate::position::LogPosition;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Frame fetcher 버퍼 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    pub initial_capacity: usize,
    pub growth_factor: f32,
    /// None 이면 무한 대기
    pub read_timeout: Option<Duration>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            read_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 미확인(ack 전) 이벤트 최대 개수
    pub capacity: usize,
    pub batch_size: usize,
    pub get_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            capacity: 16 * 1024,
            batch_size: 1000,
            get_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    pub detecting_retry_times: u32,
    pub switch_enable: bool,
    pub heartbeat_interval: Duration,
}

impl Default for HaConfig {
    fn default() -> Self {
        HaConfig {
            detecting_retry_times: 3,
            switch_enable: false,
            heartbeat_interval: Duration::from_secs(3),
        }
    }
}

/// 로컬 파일 모드 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileQueueConfig {
    pub directory: PathBuf,
    /// 세그먼트 파일명 접두사 (e.g., "mysql-bin.")
    pub base_name: String,
    pub reload_interval: Duration,
}

impl Default for FileQueueConfig {
    fn default() -> Self {
        FileQueueConfig {
            directory: PathBuf::from("."),
            base_name: "mysql-bin.".to_string(),
            reload_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    pub destination: String,
    /// 덤프 요청에 사용하는 slave server id
    pub slave_id: u32,
    /// 저장된 위치가 없을 때의 시작 위치
    pub start_position: Option<LogPosition>,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    /// 0 이면 무한 재시도
    pub max_retries: u32,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            destination: "example".to_string(),
            slave_id: 1234,
            start_position: None,
            retry_backoff_base: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
            max_retries: 0,
        }
    }
}

/// 전체 파이프라인 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub master: SourceEndpoint,
    pub standby: Option<SourceEndpoint>,
    pub parser: ParserConfig,
    pub fetcher: FetcherConfig,
    pub store: StoreConfig,
    pub ha: HaConfig,
    pub file_queue: FileQueueConfig,
    /// 원격 위치 저장소 루트 디렉토리
    pub position_root: PathBuf,
}

impl PipelineConfig {
    /// 환경 변수로 기본값을 덮어쓴다
    pub fn from_env() -> Self {
        let mut config = PipelineConfig::default();

        if let Ok(host) = env::var("DB_HOST") {
            config.master.hostname = host;
        }
        if let Some(port) = env::var("DB_PORT").ok().and_then(|p| p.parse().ok()) {
            config.master.port = port;
        }
        if let Ok(user) = env::var("DB_USER") {
            config.master.username = user;
        }
        if let Ok(password) = env::var("DB_PASSWORD") {
            config.master.password = password;
        }
        if let Ok(database) = env::var("DB_NAME") {
            config.master.database = Some(database);
        }
        if let Ok(host) = env::var("DB_STANDBY_HOST") {
            let mut standby = config.master.clone();
            standby.hostname = host;
            config.standby = Some(standby);
        }
        if let Ok(destination) = env::var("CANAL_DESTINATION") {
            config.parser.destination = destination;
        }
        if let Some(slave_id) = env::var("CANAL_SLAVE_ID").ok().and_then(|v| v.parse().ok()) {
            config.parser.slave_id = slave_id;
        }
        if let Ok(dir) = env::var("BINLOG_DIR") {
            config.file_queue.directory = PathBuf::from(dir);
        }
        if let Ok(base_name) = env::var("BINLOG_BASE_NAME") {
            config.file_queue.base_name = base_name;
        }
        if let Ok(root) = env::var("POSITION_DIR") {
            config.position_root = PathBuf::from(root);
        }
        if let Some(capacity) = env::var("STORE_CAPACITY").ok().and_then(|v| v.parse().ok()) {
            config.store.capacity = capacity;
        }
        if let Ok(enable) = env::var("HA_SWITCH_ENABLE") {
            config.ha.switch_enable = matches!(enable.as_str(), "1" | "true" | "yes");
        }

        config
    }
}
