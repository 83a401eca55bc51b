//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 헤더: 3 bytes 길이 + 1 byte 시퀀스.
//! 길이가 MAX_PACKET_LENGTH 이면 다음 패킷이 이어진다.

use crate::error::{CdcError, Result};
use crate::position::LogPosition;
use byteorder::{LittleEndian, WriteBytesExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// 한 패킷의 최대 payload 길이
pub const MAX_PACKET_LENGTH: usize = 0x00ff_ffff;

/// 길이 + 시퀀스
pub const HEADER_LENGTH: usize = 4;

/// COM_BINLOG_DUMP 명령어 코드
pub const COM_BINLOG_DUMP: u8 = 0x12;

/// 이벤트가 없으면 EOF 를 보내라는 플래그. 기본값(0)은 블로킹 모드.
pub const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;

pub const OK_MARKER: u8 = 0x00;
pub const EOF_MARKER: u8 = 0xfe;
pub const ERROR_MARKER: u8 = 0xff;

/// 패킷 쓰기. 큰 데이터는 MAX_PACKET_LENGTH 단위로 나눈다.
pub async fn write_packet<W>(writer: &mut W, data: &[u8], mut sequence: u8) -> Result<u8>
where
    W: AsyncWrite + Unpin,
{
    let mut chunks = data.chunks(MAX_PACKET_LENGTH).peekable();
    let mut last_len;
    loop {
        let chunk = chunks.next().unwrap_or(&[]);
        last_len = chunk.len();

        let mut header = Vec::with_capacity(HEADER_LENGTH);
        WriteBytesExt::write_u24::<LittleEndian>(&mut header, chunk.len() as u32)?;
        WriteBytesExt::write_u8(&mut header, sequence)?;

        writer
            .write_all(&header)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write header: {}", e)))?;
        writer
            .write_all(chunk)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write data: {}", e)))?;
        sequence = sequence.wrapping_add(1);

        if chunks.peek().is_none() {
            break;
        }
    }

    // 정확히 최대 길이로 끝나면 빈 패킷으로 종료를 알린다
    if last_len == MAX_PACKET_LENGTH {
        let mut header = Vec::with_capacity(HEADER_LENGTH);
        WriteBytesExt::write_u24::<LittleEndian>(&mut header, 0)?;
        WriteBytesExt::write_u8(&mut header, sequence)?;
        writer.write_all(&header).await?;
        sequence = sequence.wrapping_add(1);
    }

    writer
        .flush()
        .await
        .map_err(|e| CdcError::IoError(format!("Failed to flush: {}", e)))?;
    Ok(sequence)
}

/// COM_BINLOG_DUMP 명령 본문
///
/// [0x12][position u32][flags u16][server_id u32][file name]
pub fn encode_binlog_dump(server_id: u32, position: &LogPosition, flags: u16) -> Result<Vec<u8>> {
    let offset = u32::try_from(position.position).map_err(|_| {
        CdcError::ProtocolError(format!(
            "Binlog offset does not fit COM_BINLOG_DUMP: {}",
            position
        ))
    })?;

    let mut command = Vec::with_capacity(11 + position.file_name.len());
    WriteBytesExt::write_u8(&mut command, COM_BINLOG_DUMP)?;
    WriteBytesExt::write_u32::<LittleEndian>(&mut command, offset)?;
    WriteBytesExt::write_u16::<LittleEndian>(&mut command, flags)?;
    WriteBytesExt::write_u32::<LittleEndian>(&mut command, server_id)?;
    command.extend_from_slice(position.file_name.as_bytes());

    debug!("Encoded COM_BINLOG_DUMP: server_id={}, position={}", server_id, position);
    Ok(command)
}

/// Error 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub error_code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrorPacket {
    /// [0xff][errno u16]['#' sqlstate(5)][message]
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_error_packet(data) || data.len() < 3 {
            return Err(CdcError::ProtocolError(
                "Not an error packet".to_string(),
            ));
        }

        let error_code = u16::from_le_bytes([data[1], data[2]]);
        let rest = &data[3..];
        let (sql_state, message) = if rest.first() == Some(&b'#') && rest.len() >= 6 {
            (
                Some(String::from_utf8_lossy(&rest[1..6]).into_owned()),
                &rest[6..],
            )
        } else {
            (None, rest)
        };

        Ok(ErrorPacket {
            error_code,
            sql_state,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }

    pub fn into_error(self) -> CdcError {
        CdcError::ProtocolError(format!(
            "Received error packet: errno={}, sqlstate={}, message={}",
            self.error_code,
            self.sql_state.as_deref().unwrap_or("-"),
            self.message
        ))
    }
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == ERROR_MARKER
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == OK_MARKER
}

/// EOF 패킷 확인 (0xFE, 패킷 길이 < 9)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == EOF_MARKER && data.len() < 9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_error_packet() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[0x00, 0x01, 0x02]));
    }

    #[test]
    fn test_is_ok_packet() {
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(!is_ok_packet(&[0xFF, 0x01, 0x02]));
    }

    #[test]
    fn test_eof_packet_is_short() {
        assert!(is_eof_packet(&[0xFE, 0x00, 0x00, 0x02, 0x00]));
        assert!(!is_eof_packet(&[0xFE; 20]));
    }

    #[test]
    fn test_parse_error_packet() {
        let mut data = vec![0xFF, 0x3c, 0x05];
        data.extend_from_slice(b"#HY000");
        data.extend_from_slice(b"A slave with the same server_uuid has connected");
        let packet = ErrorPacket::parse(&data).unwrap();
        assert_eq!(packet.error_code, 1340);
        assert_eq!(packet.sql_state.as_deref(), Some("HY000"));
        assert!(packet.message.starts_with("A slave"));

        let err = packet.into_error();
        assert!(err.to_string().contains("errno=1340"));
    }

    #[test]
    fn test_encode_binlog_dump() {
        let command = encode_binlog_dump(1001, &LogPosition::new("mysql-bin.000002", 120), 0).unwrap();
        assert_eq!(command[0], COM_BINLOG_DUMP);
        assert_eq!(&command[1..5], &120u32.to_le_bytes());
        assert_eq!(&command[5..7], &[0, 0]);
        assert_eq!(&command[7..11], &1001u32.to_le_bytes());
        assert_eq!(&command[11..], b"mysql-bin.000002");

        let too_far = LogPosition::new("mysql-bin.000002", u64::from(u32::MAX) + 1);
        assert!(encode_binlog_dump(1001, &too_far, 0).is_err());
    }

    #[tokio::test]
    async fn test_write_packet_header() {
        let mut writer = tokio_test::io::Builder::new()
            .write(&[3, 0, 0, 7])
            .write(b"abc")
            .build();
        let next = write_packet(&mut writer, b"abc", 7).await.unwrap();
        assert_eq!(next, 8);
    }
}
