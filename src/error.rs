//! CDC 파이프라인 에러 타입

use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("알 수 없는 이벤트 타입: {0}")]
    UnknownEventType(u8),

    #[error("테이블 맵을 찾을 수 없음: table_id={0}")]
    TableMapNotFound(u64),

    #[error("체크섬 불일치: expected={expected:#010x}, actual={actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("버퍼 범위 초과: position={position}, needed={needed}, limit={limit}")]
    BufferUnderflow {
        position: usize,
        needed: usize,
        limit: usize,
    },

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("위치 저장 에러: {0}")]
    PositionError(String),

    #[error("이벤트 스토어 에러: {0}")]
    StoreError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("인터럽트됨")]
    Interrupted,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    /// 재연결 후 재시도할 수 있는 에러인지 확인
    ///
    /// 프로토콜 손상은 같은 바이트를 다시 읽어도 같은 결과가 나오므로 제외된다.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CdcError::ConnectionError(_)
                | CdcError::IoError(_)
                | CdcError::Timeout
                | CdcError::ChannelClosed
        )
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
