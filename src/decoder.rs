//! Binlog 이벤트 디코더
//!
//! 버퍼 하나에 이벤트 하나가 정확히 들어 있어야 한다 (origin = 이벤트 시작,
//! limit = event_len). 타입 코드별 디코딩 함수는 테이블로 조회한다.

use crate::buffer::{ColumnBitmap, LogBuffer};
use crate::context::LogContext;
use crate::error::{CdcError, Result};
use crate::events::column_type;
use crate::events::event_type::*;
use crate::events::*;
use crate::position::LogPosition;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// ROTATE 파일명 최대 길이
pub const FN_REFLEN: usize = 512;

/// QUERY post-header 에 status vars 길이가 포함되는 최소 크기
const QUERY_HEADER_MINIMAL_LEN: usize = 11;

/// v2 행 이벤트 post-header 크기 (extra data 길이 포함)
const ROWS_HEADER_LEN_V2: usize = 10;

/// 디코딩 중 FORMAT_DESCRIPTION 체크섬 계산 시 지워야 하는 플래그
const LOG_EVENT_BINLOG_IN_USE_F: u16 = 0x1;

const FLAGS_OFFSET: usize = 17;

type DecodeFn = fn(&LogHeader, &mut LogBuffer, &LogContext) -> Result<EventPayload>;

/// 타입 코드 -> 디코딩 함수 테이블
pub struct LogDecoder {
    handlers: [Option<DecodeFn>; 256],
}

impl Default for LogDecoder {
    fn default() -> Self {
        LogDecoder::new()
    }
}

impl LogDecoder {
    /// 알려진 모든 이벤트 타입을 등록한 디코더
    pub fn new() -> Self {
        let mut handlers: [Option<DecodeFn>; 256] = [None; 256];
        for code in 1..=LOG_EVENT_TYPES {
            handlers[code as usize] = Some(decode_unparsed as DecodeFn);
        }

        handlers[START_EVENT_V3 as usize] = Some(decode_start_v3);
        handlers[QUERY_EVENT as usize] = Some(decode_query);
        handlers[STOP_EVENT as usize] = Some(decode_stop);
        handlers[ROTATE_EVENT as usize] = Some(decode_rotate);
        handlers[FORMAT_DESCRIPTION_EVENT as usize] = Some(decode_format_description);
        handlers[XID_EVENT as usize] = Some(decode_xid);
        handlers[TABLE_MAP_EVENT as usize] = Some(decode_table_map);
        handlers[INCIDENT_EVENT as usize] = Some(decode_incident);
        handlers[HEARTBEAT_LOG_EVENT as usize] = Some(decode_heartbeat);
        handlers[GTID_LOG_EVENT as usize] = Some(decode_gtid);
        handlers[ANONYMOUS_GTID_LOG_EVENT as usize] = Some(decode_gtid);
        for code in [
            PRE_GA_WRITE_ROWS_EVENT,
            WRITE_ROWS_EVENT_V1,
            WRITE_ROWS_EVENT,
        ] {
            handlers[code as usize] = Some(decode_write_rows);
        }
        for code in [
            PRE_GA_UPDATE_ROWS_EVENT,
            UPDATE_ROWS_EVENT_V1,
            UPDATE_ROWS_EVENT,
            PARTIAL_UPDATE_ROWS_EVENT,
        ] {
            handlers[code as usize] = Some(decode_update_rows);
        }
        for code in [
            PRE_GA_DELETE_ROWS_EVENT,
            DELETE_ROWS_EVENT_V1,
            DELETE_ROWS_EVENT,
        ] {
            handlers[code as usize] = Some(decode_delete_rows);
        }

        LogDecoder { handlers }
    }

    /// 특정 타입의 디코딩을 끈다. 해당 이벤트는 Unparsed 로 전달된다.
    pub fn disable(&mut self, type_code: u8) {
        if self.handlers[type_code as usize].is_some() {
            self.handlers[type_code as usize] = Some(decode_unparsed);
        }
    }

    /// 이벤트 하나를 디코딩하고 컨텍스트를 갱신한다.
    ///
    /// 성공하면 버퍼의 position 은 limit 에 있다.
    pub fn decode(&self, buffer: &mut LogBuffer, context: &mut LogContext) -> Result<LogEvent> {
        let header = LogHeader::parse(buffer, context.format_description())?;
        let event_len = header.event_len as usize;

        if buffer.limit() != event_len {
            return Err(CdcError::BinlogParseError(format!(
                "Event length mismatch: header says {} bytes, frame has {} (type={})",
                event_len,
                buffer.limit(),
                header.type_code
            )));
        }

        if is_checksum_active(header.checksum_alg) {
            verify_checksum(&header, buffer)?;
            buffer.set_limit(event_len - BINLOG_CHECKSUM_LEN)?;
        }

        let payload = match self.handlers[header.type_code as usize] {
            Some(decode) => decode(&header, buffer, context)?,
            None if header.is_ignorable() => {
                debug!(
                    "Skipping ignorable unknown event: type={}, len={}",
                    header.type_code, event_len
                );
                decode_unparsed(&header, buffer, context)?
            }
            None => return Err(CdcError::UnknownEventType(header.type_code)),
        };

        let limit = buffer.limit();
        buffer.set_position(limit)?;

        let position = update_context(&header, &payload, context);
        Ok(LogEvent {
            header,
            position,
            payload,
        })
    }
}

fn verify_checksum(header: &LogHeader, buffer: &LogBuffer) -> Result<()> {
    let event_len = header.event_len as usize;
    let body_len = event_len.checked_sub(BINLOG_CHECKSUM_LEN).ok_or_else(|| {
        CdcError::BinlogParseError(format!("Event too short for checksum: {} bytes", event_len))
    })?;
    let data = buffer.peek_bytes(0, body_len)?;

    let actual = if header.type_code == FORMAT_DESCRIPTION_EVENT
        && header.flags & LOG_EVENT_BINLOG_IN_USE_F != 0
    {
        let mut copy = data.to_vec();
        copy[FLAGS_OFFSET] &= !(LOG_EVENT_BINLOG_IN_USE_F as u8);
        crc32fast::hash(&copy)
    } else {
        crc32fast::hash(data)
    };

    if actual != header.crc {
        return Err(CdcError::ChecksumMismatch {
            expected: header.crc,
            actual,
        });
    }
    Ok(())
}

/// 컨텍스트 갱신 후 이 이벤트의 재시작 위치를 돌려준다
fn update_context(header: &LogHeader, payload: &EventPayload, context: &mut LogContext) -> LogPosition {
    match payload {
        EventPayload::FormatDescription(description) => {
            context.set_format_description(description.clone());
        }
        // v1/v3 binlog 은 FDE 없이 START_V3 로 포맷을 알린다
        EventPayload::StartV3(start)
            if matches!(start.binlog_version, 1 | 3)
                && context.format_description().binlog_version != start.binlog_version =>
        {
            context.set_format_description(FormatDescription::for_binlog_version(start.binlog_version));
        }
        EventPayload::TableMap(table) => {
            context.put_table(table.clone());
        }
        EventPayload::Rotate(rotate) => {
            let next = LogPosition::new(rotate.file_name.clone(), rotate.position);
            context.set_position(next.clone());
            return if header.log_pos == 0 {
                LogPosition::new(rotate.file_name.clone(), 0)
            } else {
                next
            };
        }
        _ => {}
    }

    let file_name = context
        .position()
        .map(|p| p.file_name.clone())
        .unwrap_or_default();
    if header.log_pos == 0 {
        return LogPosition::new(file_name, 0);
    }
    let position = LogPosition::new(file_name, header.log_pos);
    context.set_position(position.clone());
    position
}

fn common_header_len(context: &LogContext) -> usize {
    context.format_description().common_header_len()
}

fn decode_unparsed(_: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    buffer.set_position(common_header_len(context))?;
    let rest = buffer.get_bytes(buffer.remaining())?;
    Ok(EventPayload::Unparsed(Bytes::from(rest)))
}

fn decode_stop(_: &LogHeader, _: &mut LogBuffer, _: &LogContext) -> Result<EventPayload> {
    Ok(EventPayload::Stop)
}

fn decode_start_v3(_: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    buffer.set_position(common_header_len(context))?;
    let binlog_version = buffer.get_u16()?;
    let server_version = buffer.get_fixed_string(ST_SERVER_VER_LEN)?;
    let create_timestamp = buffer.get_u32()?;
    Ok(EventPayload::StartV3(StartEventV3 {
        binlog_version,
        server_version,
        create_timestamp,
    }))
}

/// FORMAT_DESCRIPTION 은 현재 포맷과 무관하게 고정 위치에서 읽는다
fn decode_format_description(
    header: &LogHeader,
    buffer: &mut LogBuffer,
    _: &LogContext,
) -> Result<EventPayload> {
    buffer.set_position(LOG_EVENT_MINIMAL_HEADER_LEN)?;
    let binlog_version = buffer.get_u16()?;
    let server_version = buffer.get_fixed_string(ST_SERVER_VER_LEN)?;
    let create_timestamp = buffer.get_u32()?;
    let common_header_len = buffer.get_u8()?;

    let server_version_split = split_server_version(&server_version);
    let checksum_version =
        version_product(server_version_split) >= version_product(CHECKSUM_VERSION_SPLIT);

    let fixed = LOG_EVENT_MINIMAL_HEADER_LEN + ST_COMMON_HEADER_LEN_OFFSET + 1;
    let trailer = if checksum_version {
        BINLOG_CHECKSUM_ALG_DESC_LEN + BINLOG_CHECKSUM_LEN
    } else {
        0
    };
    let table_len = (header.event_len as usize)
        .checked_sub(fixed + trailer)
        .ok_or_else(|| {
            CdcError::BinlogParseError(format!(
                "Format description event too short: {} bytes",
                header.event_len
            ))
        })?;
    let post_header_len = buffer.get_bytes(table_len)?;

    Ok(EventPayload::FormatDescription(FormatDescription {
        binlog_version,
        server_version,
        server_version_split,
        create_timestamp,
        common_header_len,
        post_header_len,
        checksum_alg: if checksum_version {
            header.checksum_alg
        } else {
            BINLOG_CHECKSUM_ALG_UNDEF
        },
    }))
}

fn decode_rotate(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    let description = context.format_description();
    let common_header_len = description.common_header_len();
    let post_header_len = description.post_header_len(header.type_code);

    buffer.set_position(common_header_len)?;
    let position = if post_header_len != 0 {
        buffer.get_u64()?
    } else {
        crate::position::BIN_LOG_HEADER_SIZE
    };

    buffer.set_position(common_header_len + post_header_len)?;
    let len = buffer.remaining().min(FN_REFLEN - 1);
    let file_name = buffer.get_fixed_string(len)?;

    Ok(EventPayload::Rotate(RotateEvent {
        file_name,
        position,
    }))
}

fn decode_xid(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    let description = context.format_description();
    buffer.set_position(
        description.common_header_len() + description.post_header_len(header.type_code),
    )?;
    Ok(EventPayload::Xid(XidEvent {
        xid: buffer.get_u64()?,
    }))
}

fn decode_incident(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    let description = context.format_description();
    let common_header_len = description.common_header_len();

    buffer.set_position(common_header_len)?;
    let number = buffer.get_u16()?;
    if number != INCIDENT_LOST_EVENTS {
        return Ok(EventPayload::Incident(IncidentEvent {
            incident: INCIDENT_NONE,
            message: None,
        }));
    }

    buffer.set_position(common_header_len + description.post_header_len(header.type_code))?;
    let message = buffer.get_length_prefixed_string()?;
    Ok(EventPayload::Incident(IncidentEvent {
        incident: number,
        message: Some(message),
    }))
}

fn decode_query(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    let description = context.format_description();
    let common_header_len = description.common_header_len();
    let post_header_len = description.post_header_len(header.type_code);

    buffer.set_position(common_header_len)?;
    let thread_id = buffer.get_u32()?;
    let exec_time = buffer.get_u32()?;
    let database_len = buffer.get_u8()? as usize;
    let error_code = buffer.get_u16()?;
    let status_vars_len = if post_header_len > QUERY_HEADER_MINIMAL_LEN {
        buffer.get_u16()? as usize
    } else {
        0
    };

    buffer.set_position(common_header_len + post_header_len)?;
    buffer.forward(status_vars_len)?;
    let database = buffer.get_fixed_string(database_len)?;
    buffer.forward(1)?;
    let query = String::from_utf8_lossy(&buffer.get_bytes(buffer.remaining())?).into_owned();

    Ok(EventPayload::Query(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        database,
        query,
    }))
}

fn decode_gtid(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    buffer.set_position(common_header_len(context))?;
    let flags = buffer.get_u8()?;
    let sid = uuid::Uuid::from_slice(&buffer.get_bytes(16)?)
        .map_err(|e| CdcError::BinlogParseError(format!("Invalid GTID sid: {}", e)))?;
    let gno = buffer.get_u64()?;
    Ok(EventPayload::Gtid(GtidEvent {
        flags,
        anonymous: header.type_code == ANONYMOUS_GTID_LOG_EVENT,
        sid,
        gno,
    }))
}

fn decode_heartbeat(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    let description = context.format_description();
    buffer.set_position(
        description.common_header_len() + description.post_header_len(header.type_code),
    )?;
    let log_ident = buffer.get_fixed_string(buffer.remaining())?;
    Ok(EventPayload::Heartbeat(HeartbeatEvent { log_ident }))
}

fn decode_table_map(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    let description = context.format_description();
    let common_header_len = description.common_header_len();
    let post_header_len = description.post_header_len(header.type_code);

    buffer.set_position(common_header_len)?;
    let table_id = if post_header_len == 6 {
        buffer.get_u32()? as u64
    } else {
        buffer.get_u48()?
    };
    let flags = buffer.get_u16()?;

    buffer.set_position(common_header_len + post_header_len)?;
    let database = buffer.get_length_prefixed_string()?;
    buffer.forward(1)?;
    let table = buffer.get_length_prefixed_string()?;
    buffer.forward(1)?;

    let column_count = buffer.get_packed_len()? as usize;
    let mut columns: Vec<ColumnInfo> = buffer
        .get_bytes(column_count)?
        .into_iter()
        .map(|type_code| ColumnInfo { type_code, meta: 0 })
        .collect();

    let nullable = if buffer.has_remaining() {
        let meta_len = buffer.get_packed_len()? as usize;
        let meta_start = buffer.position();
        let meta_end = meta_start + meta_len;
        let limit = buffer.limit();
        if meta_end > limit {
            return Err(CdcError::BufferUnderflow {
                position: meta_start,
                needed: meta_len,
                limit,
            });
        }

        buffer.set_limit(meta_end)?;
        decode_column_metadata(buffer, &mut columns)?;
        buffer.set_limit(limit)?;
        buffer.set_position(meta_end)?;

        buffer.get_bitmap(column_count)?
    } else {
        ColumnBitmap::new(column_count, vec![0u8; (column_count + 7) / 8])
    };

    Ok(EventPayload::TableMap(Arc::new(TableMapEvent {
        table_id,
        flags,
        database,
        table,
        columns,
        nullable,
    })))
}

/// 타입별 메타데이터 폭
///
/// | 타입 | 폭 |
/// |---|---|
/// | FLOAT, DOUBLE, BLOB 계열, GEOMETRY, JSON | 1 |
/// | STRING | 2 (real_type << 8 + len) |
/// | BIT, VARCHAR | 2 (LE) |
/// | NEWDECIMAL | 2 (precision << 8 + scale) |
/// | TIME2, DATETIME2, TIMESTAMP2 | 1 |
/// | 그 외 | 0 |
fn decode_column_metadata(buffer: &mut LogBuffer, columns: &mut [ColumnInfo]) -> Result<()> {
    use column_type::*;

    for column in columns.iter_mut() {
        column.meta = match column.type_code {
            TINY_BLOB | BLOB | MEDIUM_BLOB | LONG_BLOB | DOUBLE | FLOAT | GEOMETRY | JSON => {
                buffer.get_u8()? as u16
            }
            SET | ENUM => {
                warn!(
                    "This enumeration value is only used internally and cannot exist in a binlog: type={}",
                    column.type_code
                );
                0
            }
            STRING => {
                let real_type = buffer.get_u8()? as u16;
                (real_type << 8) + buffer.get_u8()? as u16
            }
            BIT | VARCHAR => buffer.get_u16()?,
            NEWDECIMAL => {
                let precision = buffer.get_u8()? as u16;
                (precision << 8) + buffer.get_u8()? as u16
            }
            TIME2 | DATETIME2 | TIMESTAMP2 => buffer.get_u8()? as u16,
            _ => 0,
        };
    }
    Ok(())
}

fn rows_version(type_code: u8) -> u8 {
    match type_code {
        PRE_GA_WRITE_ROWS_EVENT | PRE_GA_UPDATE_ROWS_EVENT | PRE_GA_DELETE_ROWS_EVENT => 0,
        WRITE_ROWS_EVENT_V1 | UPDATE_ROWS_EVENT_V1 | DELETE_ROWS_EVENT_V1 => 1,
        _ => 2,
    }
}

fn decode_write_rows(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    decode_rows(RowsKind::Write, header, buffer, context)
}

fn decode_update_rows(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    decode_rows(RowsKind::Update, header, buffer, context)
}

fn decode_delete_rows(header: &LogHeader, buffer: &mut LogBuffer, context: &LogContext) -> Result<EventPayload> {
    decode_rows(RowsKind::Delete, header, buffer, context)
}

/// 행 이벤트 프레이밍만 읽고 행 이미지는 원본 바이트로 둔다.
/// 참조하는 테이블 맵이 컨텍스트에 없으면 실패한다.
fn decode_rows(
    kind: RowsKind,
    header: &LogHeader,
    buffer: &mut LogBuffer,
    context: &LogContext,
) -> Result<EventPayload> {
    let description = context.format_description();
    let common_header_len = description.common_header_len();
    let post_header_len = description.post_header_len(header.type_code);

    buffer.set_position(common_header_len)?;
    let table_id = if post_header_len == 6 {
        buffer.get_u32()? as u64
    } else {
        buffer.get_u48()?
    };
    let flags = buffer.get_u16()?;
    let extra_data = if post_header_len == ROWS_HEADER_LEN_V2 {
        let extra_len = buffer.get_u16()? as usize;
        let data = buffer.get_bytes(extra_len.saturating_sub(2))?;
        Bytes::from(data)
    } else {
        Bytes::new()
    };

    let table = context
        .table(table_id)
        .ok_or(CdcError::TableMapNotFound(table_id))?;

    buffer.set_position(common_header_len + post_header_len + extra_data.len())?;
    let column_count = buffer.get_packed_len()?;
    let columns_present = buffer.get_bitmap(column_count as usize)?;
    let columns_changed = if kind == RowsKind::Update {
        Some(buffer.get_bitmap(column_count as usize)?)
    } else {
        None
    };
    let rows = Bytes::from(buffer.get_bytes(buffer.remaining())?);

    Ok(EventPayload::Rows(RowsEvent {
        kind,
        version: rows_version(header.type_code),
        table_id,
        flags,
        extra_data,
        column_count,
        columns_present,
        columns_changed,
        database: table.database.clone(),
        table: table.table.clone(),
        rows,
    }))
}
