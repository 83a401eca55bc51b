//! MySQL Binlog 수집 파이프라인 핵심 구현
//!
//! 복제 스트림(또는 로컬 binlog 파일)을 읽어 위치가 붙은 이벤트로 디코딩하고,
//! 제한된 크기의 이벤트 스토어를 통해 소비자에게 전달합니다.
//! 주요 기능:
//! - Binlog 프로토콜 프레이밍 및 이벤트 디코딩
//! - destination 별 재시작 위치 저장 (메모리 / 원격 / 조합)
//! - get / ack / rollback 을 지원하는 이벤트 스토어와 다중 producer barrier
//! - 하트비트 기반 HA 전환

pub mod barrier;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod context;
pub mod decoder;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod file_queue;
pub mod ha;
pub mod parser;
pub mod position;
pub mod position_manager;
pub mod protocol;
pub mod registry;
pub mod sink;
pub mod store;

#[cfg(test)]
mod test_support;

pub use buffer::LogBuffer;
pub use context::LogContext;
pub use decoder::LogDecoder;
pub use error::{CdcError, Result};
pub use events::{EventPayload, LogEvent};
pub use parser::{LocalBinlogParser, MysqlEventParser};
pub use position::LogPosition;
pub use store::MemoryEventStore;
