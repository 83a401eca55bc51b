//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use crate::buffer::{ColumnBitmap, LogBuffer};
use crate::error::Result;
use crate::position::LogPosition;
use byteorder::{LittleEndian, WriteBytesExt};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// v1 (3.23) 공통 헤더 크기: position / flags 없음
pub const OLD_HEADER_LEN: usize = 13;

/// v3, v4 공통 헤더 크기
pub const LOG_EVENT_HEADER_LEN: usize = 19;

/// FORMAT_DESCRIPTION / ROTATE 의 고정 헤더 크기
pub const LOG_EVENT_MINIMAL_HEADER_LEN: usize = 19;

/// START_V3 post-header 안의 binlog 버전 / 서버 버전 / 공통 헤더 길이 오프셋
pub const ST_BINLOG_VER_OFFSET: usize = 0;
pub const ST_SERVER_VER_OFFSET: usize = 2;
pub const ST_SERVER_VER_LEN: usize = 50;
pub const ST_CREATED_OFFSET: usize = ST_SERVER_VER_OFFSET + ST_SERVER_VER_LEN;
pub const ST_COMMON_HEADER_LEN_OFFSET: usize = ST_CREATED_OFFSET + 4;

/// 체크섬 알고리즘
pub const BINLOG_CHECKSUM_ALG_OFF: u8 = 0;
pub const BINLOG_CHECKSUM_ALG_CRC32: u8 = 1;
pub const BINLOG_CHECKSUM_ALG_UNDEF: u8 = 255;
pub const BINLOG_CHECKSUM_LEN: usize = 4;
pub const BINLOG_CHECKSUM_ALG_DESC_LEN: usize = 1;

/// 체크섬을 처음 도입한 서버 버전
pub const CHECKSUM_VERSION_SPLIT: [u32; 3] = [5, 6, 1];

/// 알 수 없는 이벤트라도 이 플래그가 있으면 건너뛸 수 있다
pub const LOG_EVENT_IGNORABLE_F: u16 = 0x80;

/// 알려진 마지막 이벤트 타입 코드
pub const LOG_EVENT_TYPES: u8 = 40;

/// 이벤트 타입 코드
pub mod event_type {
    pub const UNKNOWN_EVENT: u8 = 0;
    pub const START_EVENT_V3: u8 = 1;
    pub const QUERY_EVENT: u8 = 2;
    pub const STOP_EVENT: u8 = 3;
    pub const ROTATE_EVENT: u8 = 4;
    pub const INTVAR_EVENT: u8 = 5;
    pub const LOAD_EVENT: u8 = 6;
    pub const SLAVE_EVENT: u8 = 7;
    pub const CREATE_FILE_EVENT: u8 = 8;
    pub const APPEND_BLOCK_EVENT: u8 = 9;
    pub const EXEC_LOAD_EVENT: u8 = 10;
    pub const DELETE_FILE_EVENT: u8 = 11;
    pub const NEW_LOAD_EVENT: u8 = 12;
    pub const RAND_EVENT: u8 = 13;
    pub const USER_VAR_EVENT: u8 = 14;
    pub const FORMAT_DESCRIPTION_EVENT: u8 = 15;
    pub const XID_EVENT: u8 = 16;
    pub const BEGIN_LOAD_QUERY_EVENT: u8 = 17;
    pub const EXECUTE_LOAD_QUERY_EVENT: u8 = 18;
    pub const TABLE_MAP_EVENT: u8 = 19;
    pub const PRE_GA_WRITE_ROWS_EVENT: u8 = 20;
    pub const PRE_GA_UPDATE_ROWS_EVENT: u8 = 21;
    pub const PRE_GA_DELETE_ROWS_EVENT: u8 = 22;
    pub const WRITE_ROWS_EVENT_V1: u8 = 23;
    pub const UPDATE_ROWS_EVENT_V1: u8 = 24;
    pub const DELETE_ROWS_EVENT_V1: u8 = 25;
    pub const INCIDENT_EVENT: u8 = 26;
    pub const HEARTBEAT_LOG_EVENT: u8 = 27;
    pub const IGNORABLE_LOG_EVENT: u8 = 28;
    pub const ROWS_QUERY_LOG_EVENT: u8 = 29;
    pub const WRITE_ROWS_EVENT: u8 = 30;
    pub const UPDATE_ROWS_EVENT: u8 = 31;
    pub const DELETE_ROWS_EVENT: u8 = 32;
    pub const GTID_LOG_EVENT: u8 = 33;
    pub const ANONYMOUS_GTID_LOG_EVENT: u8 = 34;
    pub const PREVIOUS_GTIDS_LOG_EVENT: u8 = 35;
    pub const TRANSACTION_CONTEXT_EVENT: u8 = 36;
    pub const VIEW_CHANGE_EVENT: u8 = 37;
    pub const XA_PREPARE_LOG_EVENT: u8 = 38;
    pub const PARTIAL_UPDATE_ROWS_EVENT: u8 = 39;
    pub const TRANSACTION_PAYLOAD_EVENT: u8 = 40;
}

/// 컬럼 타입 코드 (enum_field_types)
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

use event_type::*;

/// 서버 버전 문자열에서 숫자 세 개를 추출한다. "5.6.10-log" -> [5, 6, 10]
pub fn split_server_version(version: &str) -> [u32; 3] {
    let mut split = [0u32; 3];
    for (slot, part) in split.iter_mut().zip(
        version
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty()),
    ) {
        *slot = part.parse().unwrap_or(0);
    }
    split
}

pub fn version_product(split: [u32; 3]) -> u64 {
    (split[0] as u64 * 256 + split[1] as u64) * 256 + split[2] as u64
}

/// 이벤트 포맷 정보 (FORMAT_DESCRIPTION_EVENT)
///
/// 이후 모든 이벤트의 헤더 길이와 체크섬 알고리즘을 결정한다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescription {
    /// Binlog 포맷 버전 (1, 3, 4)
    pub binlog_version: u16,
    /// 서버 버전 문자열
    pub server_version: String,
    pub server_version_split: [u32; 3],
    pub create_timestamp: u32,
    pub common_header_len: u8,
    /// post_header_len[type - 1]
    pub post_header_len: Vec<u8>,
    pub checksum_alg: u8,
}

impl Default for FormatDescription {
    fn default() -> Self {
        FormatDescription::for_binlog_version(4)
    }
}

impl FormatDescription {
    /// 해당 binlog 버전의 기본 포맷. 알 수 없는 버전은 4 로 취급한다.
    pub fn for_binlog_version(binlog_version: u16) -> Self {
        let start_v3_header_len = (ST_COMMON_HEADER_LEN_OFFSET) as u8;
        let mut post_header_len = vec![0u8; LOG_EVENT_TYPES as usize];
        let mut set = |code: u8, len: u8| post_header_len[code as usize - 1] = len;

        let (common_header_len, server_version) = match binlog_version {
            1 => {
                set(START_EVENT_V3, start_v3_header_len);
                set(QUERY_EVENT, 11);
                set(LOAD_EVENT, 18);
                set(CREATE_FILE_EVENT, 4);
                set(APPEND_BLOCK_EVENT, 4);
                set(EXEC_LOAD_EVENT, 4);
                set(DELETE_FILE_EVENT, 4);
                set(NEW_LOAD_EVENT, 18);
                (OLD_HEADER_LEN as u8, "3.23")
            }
            3 => {
                set(START_EVENT_V3, start_v3_header_len);
                set(QUERY_EVENT, 11);
                set(ROTATE_EVENT, 8);
                set(LOAD_EVENT, 18);
                set(CREATE_FILE_EVENT, 4);
                set(APPEND_BLOCK_EVENT, 4);
                set(EXEC_LOAD_EVENT, 4);
                set(DELETE_FILE_EVENT, 4);
                set(NEW_LOAD_EVENT, 18);
                (LOG_EVENT_HEADER_LEN as u8, "4.0")
            }
            _ => {
                set(START_EVENT_V3, start_v3_header_len);
                set(QUERY_EVENT, 13);
                set(ROTATE_EVENT, 8);
                set(LOAD_EVENT, 18);
                set(CREATE_FILE_EVENT, 4);
                set(APPEND_BLOCK_EVENT, 4);
                set(EXEC_LOAD_EVENT, 4);
                set(DELETE_FILE_EVENT, 4);
                set(NEW_LOAD_EVENT, 18);
                set(FORMAT_DESCRIPTION_EVENT, start_v3_header_len + 1 + LOG_EVENT_TYPES);
                set(BEGIN_LOAD_QUERY_EVENT, 4);
                set(EXECUTE_LOAD_QUERY_EVENT, 26);
                set(TABLE_MAP_EVENT, 8);
                set(WRITE_ROWS_EVENT_V1, 8);
                set(UPDATE_ROWS_EVENT_V1, 8);
                set(DELETE_ROWS_EVENT_V1, 8);
                set(INCIDENT_EVENT, 2);
                set(WRITE_ROWS_EVENT, 10);
                set(UPDATE_ROWS_EVENT, 10);
                set(DELETE_ROWS_EVENT, 10);
                set(GTID_LOG_EVENT, 42);
                set(ANONYMOUS_GTID_LOG_EVENT, 42);
                set(TRANSACTION_CONTEXT_EVENT, 18);
                set(VIEW_CHANGE_EVENT, 52);
                set(PARTIAL_UPDATE_ROWS_EVENT, 10);
                (LOG_EVENT_HEADER_LEN as u8, "5.0")
            }
        };

        FormatDescription {
            binlog_version: if matches!(binlog_version, 1 | 3) { binlog_version } else { 4 },
            server_version: server_version.to_string(),
            server_version_split: split_server_version(server_version),
            create_timestamp: 0,
            common_header_len,
            post_header_len,
            checksum_alg: BINLOG_CHECKSUM_ALG_UNDEF,
        }
    }

    /// 타입별 post-header 길이. 테이블에 없는 타입은 0.
    pub fn post_header_len(&self, type_code: u8) -> usize {
        if type_code == 0 {
            return 0;
        }
        self.post_header_len
            .get(type_code as usize - 1)
            .copied()
            .unwrap_or(0) as usize
    }

    pub fn common_header_len(&self) -> usize {
        self.common_header_len as usize
    }

    /// 체크섬이 있는 서버 버전인지
    pub fn is_checksum_version(&self) -> bool {
        version_product(self.server_version_split) >= version_product(CHECKSUM_VERSION_SPLIT)
    }

    pub fn has_checksum(&self) -> bool {
        is_checksum_active(self.checksum_alg)
    }
}

pub fn is_checksum_active(alg: u8) -> bool {
    alg != BINLOG_CHECKSUM_ALG_OFF && alg != BINLOG_CHECKSUM_ALG_UNDEF
}

/// Binlog 이벤트 공통 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub when: u32,
    /// 이벤트 타입 코드
    pub type_code: u8,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 전체 길이 (헤더 + post-header + body + 체크섬)
    pub event_len: u32,
    /// 다음 이벤트 위치. 0 이면 위치를 옮기지 않는다.
    pub log_pos: u64,
    /// 이벤트 플래그
    pub flags: u16,
    pub checksum_alg: u8,
    pub crc: u32,
}

impl LogHeader {
    /// 로컬에서 합성하는 이벤트용 빈 헤더
    pub fn synthetic(type_code: u8) -> Self {
        LogHeader {
            when: 0,
            type_code,
            server_id: 0,
            event_len: 0,
            log_pos: 0,
            flags: 0,
            checksum_alg: BINLOG_CHECKSUM_ALG_UNDEF,
            crc: 0,
        }
    }

    /// 공통 헤더 읽기
    ///
    /// 버퍼의 origin 이 이벤트 시작이어야 한다.
    pub fn parse(buffer: &mut LogBuffer, description: &FormatDescription) -> Result<Self> {
        let when = buffer.get_u32()?;
        let type_code = buffer.get_u8()?;
        let server_id = buffer.get_u32()?;
        let event_len = buffer.get_u32()?;

        let mut header = LogHeader {
            when,
            type_code,
            server_id,
            event_len,
            log_pos: 0,
            flags: 0,
            checksum_alg: BINLOG_CHECKSUM_ALG_UNDEF,
            crc: 0,
        };

        if description.binlog_version == 1 {
            return Ok(header);
        }

        header.log_pos = buffer.get_u32()? as u64;
        // 4.0 이하는 이벤트 시작 위치를 기록하므로 끝 위치로 맞춘다. 0 은 그대로 둔다.
        if description.binlog_version == 3
            && type_code < FORMAT_DESCRIPTION_EVENT
            && header.log_pos != 0
        {
            header.log_pos += event_len as u64;
        }
        header.flags = buffer.get_u16()?;

        match type_code {
            FORMAT_DESCRIPTION_EVENT => {
                let common_header_len =
                    buffer.peek_u8(LOG_EVENT_MINIMAL_HEADER_LEN + ST_COMMON_HEADER_LEN_OFFSET)?
                        as usize;
                let version_bytes =
                    buffer.peek_bytes(common_header_len + ST_SERVER_VER_OFFSET, ST_SERVER_VER_LEN)?;
                let end = version_bytes.iter().position(|&b| b == 0).unwrap_or(version_bytes.len());
                let server_version = String::from_utf8_lossy(&version_bytes[..end]).into_owned();

                if version_product(split_server_version(&server_version))
                    >= version_product(CHECKSUM_VERSION_SPLIT)
                {
                    let offset = (event_len as usize)
                        .checked_sub(BINLOG_CHECKSUM_LEN + BINLOG_CHECKSUM_ALG_DESC_LEN)
                        .ok_or_else(|| {
                            crate::error::CdcError::BinlogParseError(format!(
                                "Format description event too short: {} bytes",
                                event_len
                            ))
                        })?;
                    header.checksum_alg = buffer.peek_u8(offset)?;
                }
            }
            _ => {
                header.checksum_alg = description.checksum_alg;
            }
        }

        if is_checksum_active(header.checksum_alg) {
            let offset = (event_len as usize).saturating_sub(BINLOG_CHECKSUM_LEN);
            header.crc = buffer.peek_u32(offset)?;
        }

        Ok(header)
    }

    /// 헤더를 다시 바이트로 만든다 (파싱의 역연산)
    pub fn encode(&self, description: &FormatDescription) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(description.common_header_len());
        out.write_u32::<LittleEndian>(self.when)?;
        out.write_u8(self.type_code)?;
        out.write_u32::<LittleEndian>(self.server_id)?;
        out.write_u32::<LittleEndian>(self.event_len)?;
        if description.binlog_version == 1 {
            return Ok(out);
        }
        let mut log_pos = self.log_pos;
        if description.binlog_version == 3
            && self.type_code < FORMAT_DESCRIPTION_EVENT
            && log_pos != 0
        {
            log_pos -= self.event_len as u64;
        }
        out.write_u32::<LittleEndian>(log_pos as u32)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        Ok(out)
    }

    pub fn is_ignorable(&self) -> bool {
        self.flags & LOG_EVENT_IGNORABLE_F != 0
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.when as i64, 0)
    }
}

/// START_EVENT_V3
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartEventV3 {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateEvent {
    /// 새 바이너리 로그 파일명
    pub file_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

impl RotateEvent {
    /// 와이어에서 읽지 않고 재시작 표시용으로 합성하는 rotate (위치는 파일 시작)
    pub fn synthetic(file_name: impl Into<String>) -> Self {
        RotateEvent {
            file_name: file_name.into(),
            position: crate::position::BIN_LOG_HEADER_SIZE,
        }
    }
}

/// 컬럼 타입과 메타데이터
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub type_code: u8,
    pub meta: u16,
}

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapEvent {
    /// 테이블 ID
    pub table_id: u64,
    pub flags: u16,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입 + 메타데이터 (왼쪽부터)
    pub columns: Vec<ColumnInfo>,
    /// nullable 비트맵
    pub nullable: ColumnBitmap,
}

impl TableMapEvent {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// 트랜잭션 커밋 (XID_EVENT)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XidEvent {
    pub xid: u64,
}

pub const INCIDENT_NONE: u16 = 0;
pub const INCIDENT_LOST_EVENTS: u16 = 1;

/// 서버 측 장애 표시 (INCIDENT_EVENT)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub incident: u16,
    pub message: Option<String>,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEvent {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub error_code: u16,
    /// 데이터베이스명
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEvent {
    /// commit flag (5.6) / may-have-SBR flag (5.7+)
    pub flags: u8,
    pub anonymous: bool,
    pub sid: Uuid,
    pub gno: u64,
}

impl GtidEvent {
    /// uuid:sequence-number
    pub fn gtid(&self) -> String {
        format!("{}:{}", self.sid, self.gno)
    }
}

/// HEARTBEAT_LOG_EVENT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub log_ident: String,
}

/// 행 변경 이벤트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// 행 변경 이벤트
///
/// 행 값은 디코딩하지 않고 원본 바이트로 보관한다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowsEvent {
    pub kind: RowsKind,
    /// 0: pre-GA, 1: v1, 2: v2
    pub version: u8,
    pub table_id: u64,
    pub flags: u16,
    pub extra_data: Bytes,
    pub column_count: u64,
    pub columns_present: ColumnBitmap,
    /// UPDATE 의 after-image 컬럼 비트맵
    pub columns_changed: Option<ColumnBitmap>,
    pub database: String,
    pub table: String,
    /// 행 이미지 (undecoded)
    pub rows: Bytes,
}

/// 이벤트 페이로드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    StartV3(StartEventV3),
    FormatDescription(FormatDescription),
    Rotate(RotateEvent),
    TableMap(Arc<TableMapEvent>),
    Xid(XidEvent),
    Incident(IncidentEvent),
    Stop,
    Rows(RowsEvent),
    Query(QueryEvent),
    Gtid(GtidEvent),
    Heartbeat(HeartbeatEvent),
    /// 디코딩하지 않고 전달하는 이벤트 (post-header + body)
    Unparsed(Bytes),
}

/// 디코딩이 끝난 Binlog 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// 이벤트 헤더
    pub header: LogHeader,
    /// 이 이벤트 다음에서 재시작하기 위한 위치
    pub position: LogPosition,
    /// 이벤트 데이터
    pub payload: EventPayload,
}

impl LogEvent {
    /// 와이어에서 읽지 않은 rotate 표시. 위치 오프셋이 0 이라 재시작 위치를 옮기지 않는다.
    pub fn synthetic_rotate(file_name: impl Into<String>) -> Self {
        let rotate = RotateEvent::synthetic(file_name);
        LogEvent {
            header: LogHeader::synthetic(ROTATE_EVENT),
            position: LogPosition::new(rotate.file_name.clone(), 0),
            payload: EventPayload::Rotate(rotate),
        }
    }

    pub fn type_code(&self) -> u8 {
        self.header.type_code
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, EventPayload::Heartbeat(_))
    }

    /// 트랜잭션 경계 (XID 또는 COMMIT 쿼리)
    pub fn is_transaction_end(&self) -> bool {
        match &self.payload {
            EventPayload::Xid(_) => true,
            EventPayload::Query(q) => q.query.eq_ignore_ascii_case("COMMIT"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_server_version() {
        assert_eq!(split_server_version("5.6.10-log"), [5, 6, 10]);
        assert_eq!(split_server_version("8.0.33"), [8, 0, 33]);
        assert_eq!(split_server_version("5.5"), [5, 5, 0]);
        assert_eq!(split_server_version(""), [0, 0, 0]);
    }

    #[test]
    fn test_version_product_ordering() {
        assert!(version_product([5, 6, 1]) > version_product([5, 5, 62]));
        assert!(version_product([8, 0, 0]) > version_product(CHECKSUM_VERSION_SPLIT));
    }

    #[test]
    fn test_default_descriptor_tables() {
        let v4 = FormatDescription::default();
        assert_eq!(v4.binlog_version, 4);
        assert_eq!(v4.common_header_len(), 19);
        assert_eq!(v4.post_header_len(TABLE_MAP_EVENT), 8);
        assert_eq!(v4.post_header_len(WRITE_ROWS_EVENT), 10);
        assert_eq!(v4.post_header_len(200), 0);
        assert!(!v4.has_checksum());

        let v1 = FormatDescription::for_binlog_version(1);
        assert_eq!(v1.common_header_len(), 13);
        assert_eq!(v1.post_header_len(ROTATE_EVENT), 0);
    }

    #[test]
    fn test_v3_header_position_converted() {
        let description = FormatDescription::for_binlog_version(3);
        let header = LogHeader {
            when: 1,
            type_code: QUERY_EVENT,
            server_id: 1,
            event_len: 50,
            log_pos: 150,
            flags: 0,
            checksum_alg: BINLOG_CHECKSUM_ALG_UNDEF,
            crc: 0,
        };
        let bytes = header.encode(&description).unwrap();
        let mut buffer = LogBuffer::from_bytes(bytes);
        let parsed = LogHeader::parse(&mut buffer, &description).unwrap();
        assert_eq!(parsed.log_pos, 150);
        // 와이어에는 이벤트 시작 위치가 기록된다
        assert_eq!(buffer.peek_u32(13).unwrap(), 100);
    }

    #[test]
    fn test_v1_header_has_no_position() {
        let description = FormatDescription::for_binlog_version(1);
        let mut buffer = LogBuffer::from_bytes(vec![
            1, 0, 0, 0, // when
            QUERY_EVENT,
            7, 0, 0, 0, // server id
            13, 0, 0, 0, // event len
        ]);
        let header = LogHeader::parse(&mut buffer, &description).unwrap();
        assert_eq!(header.log_pos, 0);
        assert_eq!(header.server_id, 7);
        assert_eq!(buffer.position(), OLD_HEADER_LEN);
    }

    #[test]
    fn test_table_map_event_serde() {
        let table = TableMapEvent {
            table_id: 7,
            flags: 1,
            database: "test".to_string(),
            table: "users".to_string(),
            columns: vec![ColumnInfo {
                type_code: column_type::LONG,
                meta: 0,
            }],
            nullable: ColumnBitmap::new(1, vec![0x01]),
        };
        let event = LogEvent {
            header: LogHeader::synthetic(TABLE_MAP_EVENT),
            position: LogPosition::new("mysql-bin.000001", 320),
            payload: EventPayload::TableMap(Arc::new(table)),
        };

        let json = serde_json::to_string(&event).unwrap();
        let decoded: LogEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_synthetic_rotate_is_sentinel() {
        let event = LogEvent::synthetic_rotate("mysql-bin.000004");
        assert!(event.position.is_sentinel());
        match event.payload {
            EventPayload::Rotate(rotate) => assert_eq!(rotate.position, 4),
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
