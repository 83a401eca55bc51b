//! 이벤트 프레임 fetcher
//!
//! - `DirectLogFetcher`: COM_BINLOG_DUMP 응답 스트림에서 패킷 단위로 읽는다.
//! - `FileLogFetcher`: 로컬 binlog 파일에서 이벤트 단위로 읽는다.
//!
//! 두 fetcher 모두 fetch 성공 후 버퍼의 읽기 창이 이벤트 하나와 정확히 일치한다.

use crate::buffer::LogBuffer;
use crate::config::FetcherConfig;
use crate::error::{CdcError, Result};
use crate::events::OLD_HEADER_LEN;
use crate::position::LogPosition;
use crate::protocol::{self, ErrorPacket, HEADER_LENGTH, MAX_PACKET_LENGTH};
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tracing::{debug, info, warn};

/// Binlog 파일 매직 넘버 (".bin")
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];

/// 이벤트 헤더 안 event_len 필드 위치
const EVENT_LEN_OFFSET: usize = 9;

#[async_trait]
pub trait LogFetcher: Send {
    /// 다음 이벤트를 버퍼에 올린다. 더 읽을 것이 없으면 false.
    async fn fetch(&mut self) -> Result<bool>;

    fn buffer(&self) -> &LogBuffer;

    fn buffer_mut(&mut self) -> &mut LogBuffer;

    async fn close(&mut self) -> Result<()>;
}

/// 네트워크 스트림 fetcher
pub struct DirectLogFetcher<T> {
    stream: Option<T>,
    buffer: LogBuffer,
    read_timeout: Option<Duration>,
}

impl<T> DirectLogFetcher<T>
where
    T: AsyncRead + Unpin + Send,
{
    pub fn new(stream: T, config: &FetcherConfig) -> Self {
        DirectLogFetcher {
            stream: Some(stream),
            buffer: LogBuffer::with_capacity(config.initial_capacity, config.growth_factor),
            read_timeout: config.read_timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    async fn read_exact_at(&mut self, offset: usize, len: usize) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(CdcError::ChannelClosed)?;
        let region = self.buffer.fill_region(offset, len);
        read_fully(stream, region, self.read_timeout).await
    }

    async fn fetch_packet(&mut self) -> Result<bool> {
        self.buffer.reset_window(0, 0);

        self.read_exact_at(0, HEADER_LENGTH).await?;
        let mut packet_len = LittleEndian::read_u24(&self.buffer.window()[..3]) as usize;
        let sequence = self.buffer.window()[3];
        self.read_exact_at(HEADER_LENGTH, packet_len).await?;
        let mut total = packet_len;

        // 연속 패킷: 헤더는 버리고 payload 만 이어 붙인다
        while packet_len == MAX_PACKET_LENGTH {
            let stream = self.stream.as_mut().ok_or(CdcError::ChannelClosed)?;
            let mut header = [0u8; HEADER_LENGTH];
            read_fully(stream, &mut header, self.read_timeout).await?;
            packet_len = LittleEndian::read_u24(&header[..3]) as usize;
            self.read_exact_at(HEADER_LENGTH + total, packet_len).await?;
            total += packet_len;
        }

        let end = HEADER_LENGTH + total;
        self.buffer.reset_window(HEADER_LENGTH, end);
        let payload = self.buffer.window();

        match payload.first().copied() {
            Some(protocol::ERROR_MARKER) => Err(ErrorPacket::parse(payload)?.into_error()),
            Some(protocol::EOF_MARKER) if protocol::is_eof_packet(payload) => {
                warn!(
                    "Received EOF packet from server (seq={}), maybe caused by a duplicate slave server id",
                    sequence
                );
                Ok(false)
            }
            Some(_) => {
                // 마커 바이트 다음부터가 이벤트
                self.buffer.reset_window(HEADER_LENGTH + 1, end);
                Ok(true)
            }
            None => Err(CdcError::ProtocolError(
                "Received empty packet".to_string(),
            )),
        }
    }
}

#[async_trait]
impl<T> LogFetcher for DirectLogFetcher<T>
where
    T: AsyncRead + Unpin + Send,
{
    /// 실패하면 스트림을 닫는다. 다시 fetch 하려면 재연결해야 한다.
    async fn fetch(&mut self) -> Result<bool> {
        match self.fetch_packet().await {
            Ok(more) => Ok(more),
            Err(e) => {
                if !matches!(e, CdcError::ChannelClosed) {
                    debug!("Closing binlog stream after fetch failure: {}", e);
                }
                self.stream = None;
                Err(e)
            }
        }
    }

    fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut LogBuffer {
        &mut self.buffer
    }

    async fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}

/// 핸드셰이크가 끝난 스트림에 COM_BINLOG_DUMP 를 보내고 fetcher 로 감싼다
pub async fn request_dump<S>(
    mut stream: S,
    server_id: u32,
    position: &LogPosition,
    config: &FetcherConfig,
) -> Result<DirectLogFetcher<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let command = protocol::encode_binlog_dump(server_id, position, 0)?;
    protocol::write_packet(&mut stream, &command, 0).await?;
    info!("Requested binlog dump from {} as slave {}", position, server_id);
    Ok(DirectLogFetcher::new(stream, config))
}

async fn read_fully<R>(stream: &mut R, buf: &mut [u8], read_timeout: Option<Duration>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let read = stream.read_exact(buf);
    let result = match read_timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| CdcError::Timeout)?,
        None => read.await,
    };
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CdcError::ConnectionError(
            "Connection closed by server".to_string(),
        )),
        Err(e) => Err(CdcError::IoError(format!("Failed to read packet: {}", e))),
    }
}

/// 로컬 binlog 파일 fetcher
///
/// 아직 쓰이는 중인 파일의 마지막 이벤트가 잘려 있으면 그 시작으로 되돌아가서
/// false 를 돌려준다. 나중에 다시 fetch 하면 이어서 읽는다.
pub struct FileLogFetcher {
    path: PathBuf,
    file: Option<File>,
    buffer: LogBuffer,
    /// 다음에 읽을 이벤트의 파일 오프셋
    offset: u64,
}

impl FileLogFetcher {
    /// 파일을 열고 매직 넘버를 확인한 뒤 start 위치로 이동한다.
    /// start 가 매직 넘버 안쪽이면 첫 이벤트부터 읽는다.
    pub async fn open(path: impl AsRef<Path>, start: u64, config: &FetcherConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to open {}: {}", path.display(), e)))?;

        let mut magic = [0u8; 4];
        let read = read_up_to(&mut file, &mut magic).await?;
        if read < magic.len() || magic != BINLOG_MAGIC {
            return Err(CdcError::BinlogParseError(format!(
                "Invalid binlog magic number: {}",
                path.display()
            )));
        }

        let offset = start.max(BINLOG_MAGIC.len() as u64);
        file.seek(SeekFrom::Start(offset)).await?;
        info!("Opened binlog file {} at {}", path.display(), offset);

        Ok(FileLogFetcher {
            path,
            file: Some(file),
            buffer: LogBuffer::with_capacity(config.initial_capacity, config.growth_factor),
            offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 다음 이벤트의 파일 오프셋
    pub fn offset(&self) -> u64 {
        self.offset
    }

    async fn rewind(&mut self) -> Result<bool> {
        if let Some(file) = self.file.as_mut() {
            file.seek(SeekFrom::Start(self.offset)).await?;
        }
        self.buffer.reset_window(0, 0);
        Ok(false)
    }
}

#[async_trait]
impl LogFetcher for FileLogFetcher {
    async fn fetch(&mut self) -> Result<bool> {
        let file = self.file.as_mut().ok_or(CdcError::ChannelClosed)?;

        self.buffer.reset_window(0, 0);
        let header = self.buffer.fill_region(0, OLD_HEADER_LEN);
        let read = read_up_to(file, header).await?;
        if read == 0 {
            self.buffer.reset_window(0, 0);
            return Ok(false);
        }
        if read < OLD_HEADER_LEN {
            return self.rewind().await;
        }

        let event_len = LittleEndian::read_u32(&self.buffer.window()[EVENT_LEN_OFFSET..]) as usize;
        if event_len < OLD_HEADER_LEN {
            return Err(CdcError::BinlogParseError(format!(
                "Invalid event length {} at {}:{}",
                event_len,
                self.path.display(),
                self.offset
            )));
        }

        let body = self.buffer.fill_region(OLD_HEADER_LEN, event_len - OLD_HEADER_LEN);
        let read = read_up_to(file, body).await?;
        if read < event_len - OLD_HEADER_LEN {
            debug!(
                "Partial event at {}:{}, waiting for more data",
                self.path.display(),
                self.offset
            );
            return self.rewind().await;
        }

        self.buffer.reset_window(0, event_len);
        self.offset += event_len as u64;
        Ok(true)
    }

    fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    fn buffer_mut(&mut self) -> &mut LogBuffer {
        &mut self.buffer
    }

    async fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}

/// EOF 를 만나기 전까지 최대한 채운다
async fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LogContext;
    use crate::decoder::LogDecoder;
    use crate::events::EventPayload;
    use crate::test_support::{EventBuilder, FileWriter};
    use tokio::io::AsyncWriteExt;

    fn packet(sequence: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u32;
        let mut out = len.to_le_bytes()[..3].to_vec();
        out.push(sequence);
        out.extend_from_slice(payload);
        out
    }

    fn event_packet(sequence: u8, event: &[u8]) -> Vec<u8> {
        let mut payload = vec![protocol::OK_MARKER];
        payload.extend_from_slice(event);
        packet(sequence, &payload)
    }

    #[tokio::test]
    async fn test_direct_fetch_event_window() {
        let event = EventBuilder::v4().xid(9, 300);
        let stream = tokio_test::io::Builder::new()
            .read(&event_packet(1, &event))
            .build();
        let mut fetcher = DirectLogFetcher::new(stream, &FetcherConfig::default());

        assert!(fetcher.fetch().await.unwrap());
        assert_eq!(fetcher.buffer().limit(), event.len());
        assert_eq!(fetcher.buffer().window(), &event[..]);

        let mut context = LogContext::new();
        let decoded = LogDecoder::new().decode(fetcher.buffer_mut(), &mut context).unwrap();
        assert!(decoded.is_transaction_end());
    }

    #[tokio::test]
    async fn test_direct_fetch_error_packet_closes() {
        let mut payload = vec![protocol::ERROR_MARKER, 0x3c, 0x05];
        payload.extend_from_slice(b"#HY000duplicate slave");
        let stream = tokio_test::io::Builder::new().read(&packet(1, &payload)).build();
        let mut fetcher = DirectLogFetcher::new(stream, &FetcherConfig::default());

        let err = fetcher.fetch().await.unwrap_err();
        assert!(matches!(err, CdcError::ProtocolError(_)));
        assert!(fetcher.is_closed());
        assert!(matches!(fetcher.fetch().await, Err(CdcError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_direct_fetch_eof_packet() {
        let stream = tokio_test::io::Builder::new()
            .read(&packet(1, &[protocol::EOF_MARKER, 0, 0, 2, 0]))
            .build();
        let mut fetcher = DirectLogFetcher::new(stream, &FetcherConfig::default());
        assert!(!fetcher.fetch().await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_fetch_broken_connection() {
        let event = EventBuilder::v4().xid(9, 300);
        let mut truncated = event_packet(1, &event);
        truncated.truncate(10);
        let stream = tokio_test::io::Builder::new().read(&truncated).build();
        let mut fetcher = DirectLogFetcher::new(stream, &FetcherConfig::default());

        let err = fetcher.fetch().await.unwrap_err();
        assert!(err.is_transient());
        assert!(fetcher.is_closed());
    }

    #[tokio::test]
    async fn test_direct_fetch_continuation_packets() {
        // 첫 패킷이 최대 길이이므로 두 번째 패킷이 이어진다
        let mut payload = vec![protocol::OK_MARKER];
        payload.resize(MAX_PACKET_LENGTH + 10, 0xab);
        let (first, second) = payload.split_at(MAX_PACKET_LENGTH);

        let stream = tokio_test::io::Builder::new()
            .read(&packet(1, first))
            .read(&packet(2, second))
            .build();
        let config = FetcherConfig {
            initial_capacity: 1024,
            ..FetcherConfig::default()
        };
        let mut fetcher = DirectLogFetcher::new(stream, &config);

        assert!(fetcher.fetch().await.unwrap());
        assert_eq!(fetcher.buffer().limit(), MAX_PACKET_LENGTH + 9);
    }

    #[tokio::test]
    async fn test_file_fetch_events_and_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mysql-bin.000001");

        let mut writer = FileWriter::new(EventBuilder::v4());
        writer.push(|b, pos| b.format_description("5.5.40", pos));
        let xid_end = writer.push(|b, pos| b.xid(1, pos));
        let builder = writer.builder();
        tokio::fs::write(&path, writer.finish()).await.unwrap();

        let mut fetcher = FileLogFetcher::open(&path, 0, &FetcherConfig::default())
            .await
            .unwrap();
        let decoder = LogDecoder::new();
        let mut context = LogContext::new();

        assert!(fetcher.fetch().await.unwrap());
        let fde = decoder.decode(fetcher.buffer_mut(), &mut context).unwrap();
        assert!(matches!(fde.payload, EventPayload::FormatDescription(_)));

        assert!(fetcher.fetch().await.unwrap());
        decoder.decode(fetcher.buffer_mut(), &mut context).unwrap();
        assert_eq!(fetcher.offset(), xid_end as u64);
        assert!(!fetcher.fetch().await.unwrap());

        // 반쯤 쓰인 이벤트는 건너뛰지 않는다
        let next = builder.xid(2, xid_end + 27);
        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(&next[..20]).await.unwrap();
        file.flush().await.unwrap();
        assert!(!fetcher.fetch().await.unwrap());
        assert_eq!(fetcher.offset(), xid_end as u64);

        file.write_all(&next[20..]).await.unwrap();
        file.flush().await.unwrap();
        assert!(fetcher.fetch().await.unwrap());
        let event = decoder.decode(fetcher.buffer_mut(), &mut context).unwrap();
        assert_eq!(event.header.log_pos, (xid_end + 27) as u64);
    }

    #[tokio::test]
    async fn test_request_dump_then_fetch() {
        let position = LogPosition::new("mysql-bin.000003", 120);
        let command = protocol::encode_binlog_dump(1234, &position, 0).unwrap();
        let event = EventBuilder::v4().rotate("mysql-bin.000003", 120, 0);
        let stream = tokio_test::io::Builder::new()
            .write(&packet(0, &command))
            .read(&event_packet(1, &event))
            .build();

        let mut fetcher = request_dump(stream, 1234, &position, &FetcherConfig::default())
            .await
            .unwrap();
        assert!(fetcher.fetch().await.unwrap());
        assert_eq!(fetcher.buffer().window(), &event[..]);
    }

    #[tokio::test]
    async fn test_file_fetch_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mysql-bin.000001");
        tokio::fs::write(&path, b"nope").await.unwrap();
        assert!(FileLogFetcher::open(&path, 4, &FetcherConfig::default()).await.is_err());
    }
}
