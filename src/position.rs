//! Binlog 처리 위치 (파일명 + 오프셋)
//!
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치.
//! 같은 destination 안에서만 비교한다.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Binlog 파일 헤더(매직 넘버) 크기. 첫 이벤트는 이 위치에서 시작한다.
pub const BIN_LOG_HEADER_SIZE: u64 = 4;

/// Binlog 파일 위치 정보
///
/// 파일명을 사전순으로, 같으면 오프셋을 숫자로 비교한다.
/// 세그먼트 번호는 고정 폭 0-패딩이므로 사전순 비교로 충분하다.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub file_name: String,
    /// 바이트 위치
    pub position: u64,
}

impl LogPosition {
    pub fn new(file_name: impl Into<String>, position: u64) -> Self {
        LogPosition {
            file_name: file_name.into(),
            position,
        }
    }

    /// 파일의 첫 이벤트 위치
    pub fn start_of(file_name: impl Into<String>) -> Self {
        Self::new(file_name, BIN_LOG_HEADER_SIZE)
    }

    /// 오프셋 0 은 "재시작 위치를 옮기지 말라"는 표시다 (가짜 rotate 이벤트).
    /// 재시작 지점 결정에 사용하면 안 된다.
    pub fn is_sentinel(&self) -> bool {
        self.position == 0
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        file_sequence(&self.file_name)
    }
}

/// "mysql-bin.000123" -> 123
pub fn file_sequence(file_name: &str) -> Option<u64> {
    file_name.rsplit('.').next().and_then(|s| s.parse().ok())
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_name, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sequence() {
        let pos = LogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(file_sequence("relay"), None);
    }

    #[test]
    fn test_ordering_file_then_offset() {
        let a = LogPosition::new("mysql-bin.000001", 9000);
        let b = LogPosition::new("mysql-bin.000002", 4);
        let c = LogPosition::new("mysql-bin.000002", 120);
        assert!(a < b);
        assert!(b < c);
        // 추이성
        assert!(a < c);
        assert_eq!(b.cmp(&b.clone()), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_large_offsets_compare_numerically() {
        let low = LogPosition::new("mysql-bin.000001", 4);
        let high = LogPosition::new("mysql-bin.000001", u64::MAX);
        assert!(low < high);
    }

    #[test]
    fn test_sentinel_and_display() {
        let fake = LogPosition::new("mysql-bin.000009", 0);
        assert!(fake.is_sentinel());
        assert!(!LogPosition::start_of("mysql-bin.000009").is_sentinel());
        assert_eq!(fake.to_string(), "mysql-bin.000009:0");
    }
}
