//! 테스트용 binlog 이벤트 바이트 생성기 (v4 포맷)

use crate::events::event_type::*;
use crate::events::{
    FormatDescription, BINLOG_CHECKSUM_ALG_CRC32, BINLOG_CHECKSUM_ALG_OFF, LOG_EVENT_HEADER_LEN,
};
use byteorder::{LittleEndian, WriteBytesExt};

pub(crate) const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];

#[derive(Debug, Clone, Copy)]
pub(crate) struct EventBuilder {
    pub checksum: bool,
    pub server_id: u32,
    pub when: u32,
}

impl EventBuilder {
    pub fn v4() -> Self {
        EventBuilder {
            checksum: false,
            server_id: 1,
            when: 1_700_000_000,
        }
    }

    pub fn with_checksum() -> Self {
        EventBuilder {
            checksum: true,
            ..Self::v4()
        }
    }

    fn header(&self, type_code: u8, event_len: usize, log_pos: u32, flags: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(event_len);
        out.write_u32::<LittleEndian>(self.when).unwrap();
        out.write_u8(type_code).unwrap();
        out.write_u32::<LittleEndian>(self.server_id).unwrap();
        out.write_u32::<LittleEndian>(event_len as u32).unwrap();
        out.write_u32::<LittleEndian>(log_pos).unwrap();
        out.write_u16::<LittleEndian>(flags).unwrap();
        out
    }

    pub fn event_with_flags(&self, type_code: u8, log_pos: u32, flags: u16, body: &[u8]) -> Vec<u8> {
        let crc_len = if self.checksum { 4 } else { 0 };
        let event_len = LOG_EVENT_HEADER_LEN + body.len() + crc_len;
        let mut out = self.header(type_code, event_len, log_pos, flags);
        out.extend_from_slice(body);
        if self.checksum {
            let crc = crc32fast::hash(&out);
            out.write_u32::<LittleEndian>(crc).unwrap();
        }
        out
    }

    pub fn event(&self, type_code: u8, log_pos: u32, body: &[u8]) -> Vec<u8> {
        self.event_with_flags(type_code, log_pos, 0, body)
    }

    /// 5.6.1 이상이면 체크섬 알고리즘 바이트와 4 byte 체크섬 자리가 붙는다
    pub fn format_description(&self, server_version: &str, log_pos: u32) -> Vec<u8> {
        let defaults = FormatDescription::default();
        let mut body = Vec::new();
        body.write_u16::<LittleEndian>(4).unwrap();
        let mut version = [0u8; 50];
        version[..server_version.len()].copy_from_slice(server_version.as_bytes());
        body.extend_from_slice(&version);
        body.write_u32::<LittleEndian>(self.when).unwrap();
        body.write_u8(LOG_EVENT_HEADER_LEN as u8).unwrap();
        body.extend_from_slice(&defaults.post_header_len);

        let with_alg = crate::events::version_product(crate::events::split_server_version(
            server_version,
        )) >= crate::events::version_product(crate::events::CHECKSUM_VERSION_SPLIT);
        if !with_alg {
            let event_len = LOG_EVENT_HEADER_LEN + body.len();
            let mut out = self.header(FORMAT_DESCRIPTION_EVENT, event_len, log_pos, 0);
            out.extend_from_slice(&body);
            return out;
        }

        body.push(if self.checksum {
            BINLOG_CHECKSUM_ALG_CRC32
        } else {
            BINLOG_CHECKSUM_ALG_OFF
        });
        let event_len = LOG_EVENT_HEADER_LEN + body.len() + 4;
        let mut out = self.header(FORMAT_DESCRIPTION_EVENT, event_len, log_pos, 0);
        out.extend_from_slice(&body);
        let crc = if self.checksum { crc32fast::hash(&out) } else { 0 };
        out.write_u32::<LittleEndian>(crc).unwrap();
        out
    }

    pub fn rotate(&self, file_name: &str, position: u64, log_pos: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u64::<LittleEndian>(position).unwrap();
        body.extend_from_slice(file_name.as_bytes());
        self.event(ROTATE_EVENT, log_pos, &body)
    }

    pub fn xid(&self, xid: u64, log_pos: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u64::<LittleEndian>(xid).unwrap();
        self.event(XID_EVENT, log_pos, &body)
    }

    pub fn query(&self, database: &str, query: &str, log_pos: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<LittleEndian>(99).unwrap(); // thread id
        body.write_u32::<LittleEndian>(0).unwrap(); // exec time
        body.write_u8(database.len() as u8).unwrap();
        body.write_u16::<LittleEndian>(0).unwrap(); // error code
        body.write_u16::<LittleEndian>(0).unwrap(); // status vars len
        body.extend_from_slice(database.as_bytes());
        body.push(0);
        body.extend_from_slice(query.as_bytes());
        self.event(QUERY_EVENT, log_pos, &body)
    }

    pub fn table_map(
        &self,
        table_id: u64,
        database: &str,
        table: &str,
        types: &[u8],
        meta: &[u8],
        nullable: &[u8],
        log_pos: u32,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u48::<LittleEndian>(table_id).unwrap();
        body.write_u16::<LittleEndian>(1).unwrap();
        body.push(database.len() as u8);
        body.extend_from_slice(database.as_bytes());
        body.push(0);
        body.push(table.len() as u8);
        body.extend_from_slice(table.as_bytes());
        body.push(0);
        body.push(types.len() as u8);
        body.extend_from_slice(types);
        body.push(meta.len() as u8);
        body.extend_from_slice(meta);
        body.extend_from_slice(nullable);
        self.event(TABLE_MAP_EVENT, log_pos, &body)
    }

    /// v2 WRITE_ROWS, 모든 컬럼 present
    pub fn write_rows(&self, table_id: u64, column_count: u8, rows: &[u8], log_pos: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u48::<LittleEndian>(table_id).unwrap();
        body.write_u16::<LittleEndian>(1).unwrap();
        body.write_u16::<LittleEndian>(2).unwrap(); // extra data len (자기 자신 포함)
        body.push(column_count);
        body.extend(std::iter::repeat(0xff).take((column_count as usize + 7) / 8));
        body.extend_from_slice(rows);
        self.event(WRITE_ROWS_EVENT, log_pos, &body)
    }

    pub fn heartbeat(&self, file_name: &str, log_pos: u32) -> Vec<u8> {
        self.event(HEARTBEAT_LOG_EVENT, log_pos, file_name.as_bytes())
    }
}

/// 매직 넘버 + 이벤트들
pub(crate) fn binlog_file(events: &[Vec<u8>]) -> Vec<u8> {
    let mut out = BINLOG_MAGIC.to_vec();
    for event in events {
        out.extend_from_slice(event);
    }
    out
}

/// 파일 안에서 각 이벤트 끝 위치를 계산하면서 이벤트를 만든다
pub(crate) struct FileWriter {
    builder: EventBuilder,
    offset: u32,
    events: Vec<Vec<u8>>,
}

impl FileWriter {
    pub fn new(builder: EventBuilder) -> Self {
        FileWriter {
            builder,
            offset: BINLOG_MAGIC.len() as u32,
            events: Vec::new(),
        }
    }

    pub fn builder(&self) -> EventBuilder {
        self.builder
    }

    /// make 는 (builder, log_pos) 로 이벤트를 만든다. 길이를 미리 알 수 없으므로 두 번 호출한다.
    pub fn push(&mut self, make: impl Fn(&EventBuilder, u32) -> Vec<u8>) -> u32 {
        let len = make(&self.builder, 0).len() as u32;
        let end = self.offset + len;
        self.events.push(make(&self.builder, end));
        self.offset = end;
        end
    }

    pub fn finish(self) -> Vec<u8> {
        binlog_file(&self.events)
    }
}

/// 스토어/싱크 테스트용 디코딩 완료 이벤트
pub(crate) fn xid_event(file_name: &str, position: u64, when: u32) -> crate::events::LogEvent {
    use crate::events::{EventPayload, LogEvent, LogHeader, XidEvent};

    let mut header = LogHeader::synthetic(XID_EVENT);
    header.when = when;
    header.log_pos = position;
    LogEvent {
        header,
        position: crate::position::LogPosition::new(file_name, position),
        payload: EventPayload::Xid(XidEvent { xid: position }),
    }
}

pub(crate) fn heartbeat_event(file_name: &str) -> crate::events::LogEvent {
    use crate::events::{EventPayload, HeartbeatEvent, LogEvent, LogHeader};

    LogEvent {
        header: LogHeader::synthetic(HEARTBEAT_LOG_EVENT),
        position: crate::position::LogPosition::new(file_name, 0),
        payload: EventPayload::Heartbeat(HeartbeatEvent {
            log_ident: file_name.to_string(),
        }),
    }
}
