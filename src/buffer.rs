//! Binlog 바이트 버퍼
//!
//! origin / position / limit 세 개의 커서를 가진 가변 크기 버퍼.
//! 외부에 노출되는 position, limit 은 모두 origin 기준의 상대 값이다.
//! 모든 읽기는 position 을 전진시키며 limit 을 넘으면 실패한다.

use crate::error::{CdcError, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// 기본 내부 배열 크기
pub const DEFAULT_INITIAL_CAPACITY: usize = 8192;

/// 기본 증가 배수
pub const DEFAULT_GROWTH_FACTOR: f32 = 2.0;

/// Packed integer 의 NULL 마커
const PACKED_NULL: u8 = 0xfb;

/// 비트 단위 nullable / present 맵
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ColumnBitmap {
    bits: usize,
    bytes: Vec<u8>,
}

impl ColumnBitmap {
    pub fn new(bits: usize, bytes: Vec<u8>) -> Self {
        ColumnBitmap { bits, bytes }
    }

    /// 비트 개수
    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// 저장에 사용된 바이트 수
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// 첫 번째 컬럼은 첫 바이트의 최하위 비트
    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn count_ones(&self) -> usize {
        (0..self.bits).filter(|&i| self.is_set(i)).count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// 프로토콜 읽기 기능을 가진 바이트 버퍼
#[derive(Debug, Clone)]
pub struct LogBuffer {
    buffer: Vec<u8>,
    origin: usize,
    position: usize,
    limit: usize,
    growth_factor: f32,
}

impl Default for LogBuffer {
    fn default() -> Self {
        LogBuffer::with_capacity(DEFAULT_INITIAL_CAPACITY, DEFAULT_GROWTH_FACTOR)
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial_capacity: usize, growth_factor: f32) -> Self {
        LogBuffer {
            buffer: vec![0u8; initial_capacity],
            origin: 0,
            position: 0,
            limit: 0,
            growth_factor,
        }
    }

    /// 주어진 바이트 전체를 읽기 창으로 하는 버퍼
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let buffer = bytes.into();
        let limit = buffer.len();
        LogBuffer {
            buffer,
            origin: 0,
            position: 0,
            limit,
            growth_factor: DEFAULT_GROWTH_FACTOR,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// 필요하면 내부 배열을 늘린다. 줄이지는 않는다.
    ///
    /// 현재 크기 * growth_factor 가 부족하면 min_capacity 를 그대로 사용한다.
    pub fn ensure_capacity(&mut self, min_capacity: usize) {
        let old_capacity = self.buffer.len();
        if min_capacity > old_capacity {
            let mut new_capacity = (old_capacity as f64 * self.growth_factor as f64) as usize;
            if new_capacity < min_capacity {
                new_capacity = min_capacity;
            }
            self.buffer.resize(new_capacity, 0);
        }
    }

    /// fetcher 가 네트워크/파일에서 데이터를 채워 넣을 영역 (절대 오프셋)
    pub(crate) fn fill_region(&mut self, offset: usize, len: usize) -> &mut [u8] {
        self.ensure_capacity(offset + len);
        if self.limit < offset + len {
            self.limit = offset + len;
        }
        &mut self.buffer[offset..offset + len]
    }

    /// 읽기 창 재설정 (절대 오프셋)
    pub(crate) fn reset_window(&mut self, origin: usize, limit: usize) {
        self.origin = origin;
        self.position = origin;
        self.limit = limit;
    }

    pub(crate) fn absolute_limit(&self) -> usize {
        self.limit
    }

    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn position(&self) -> usize {
        self.position - self.origin
    }

    pub fn set_position(&mut self, position: usize) -> Result<&mut Self> {
        let absolute = self.origin + position;
        if absolute > self.limit {
            return Err(CdcError::BufferUnderflow {
                position,
                needed: 0,
                limit: self.limit(),
            });
        }
        self.position = absolute;
        Ok(self)
    }

    pub fn limit(&self) -> usize {
        self.limit - self.origin
    }

    pub fn set_limit(&mut self, limit: usize) -> Result<&mut Self> {
        let absolute = self.origin + limit;
        if absolute > self.buffer.len() {
            return Err(CdcError::BufferUnderflow {
                position: self.position(),
                needed: limit,
                limit: self.capacity() - self.origin,
            });
        }
        self.limit = absolute;
        if self.position > self.limit {
            self.position = self.limit;
        }
        Ok(self)
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.position)
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    pub fn forward(&mut self, len: usize) -> Result<&mut Self> {
        self.check(len)?;
        self.position += len;
        Ok(self)
    }

    /// 현재 읽기 창 전체 (origin..limit)
    pub fn window(&self) -> &[u8] {
        &self.buffer[self.origin..self.limit]
    }

    fn check(&self, len: usize) -> Result<()> {
        if self.position + len > self.limit {
            return Err(CdcError::BufferUnderflow {
                position: self.position(),
                needed: len,
                limit: self.limit(),
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        self.check(len)?;
        let start = self.position;
        self.position += len;
        Ok(&self.buffer[start..start + len])
    }

    fn peek(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let start = self.origin + offset;
        if start + len > self.limit {
            return Err(CdcError::BufferUnderflow {
                position: offset,
                needed: len,
                limit: self.limit(),
            });
        }
        Ok(&self.buffer[start..start + len])
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn get_u24(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u24(self.take(3)?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn get_u48(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u48(self.take(6)?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn get_be_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn get_be_u24(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u24(self.take(3)?))
    }

    pub fn get_be_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    /// position 을 움직이지 않고 읽기 (origin 기준 오프셋)
    pub fn peek_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.peek(offset, 1)?[0])
    }

    pub fn peek_u32(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.peek(offset, 4)?))
    }

    /// origin 기준 [offset, offset + len) 구간
    pub fn peek_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.peek(offset, len)
    }

    /// Packed (length-encoded) integer
    ///
    /// - 0x00..=0xfa: 값 자체 (1 byte)
    /// - 0xfb: NULL
    /// - 0xfc: 2 byte 값 (총 3 byte)
    /// - 0xfd: 3 byte 값 (총 4 byte)
    /// - 0xfe: 8 byte 값 (총 9 byte)
    pub fn get_packed_u64(&mut self) -> Result<Option<u64>> {
        let marker = self.get_u8()?;
        match marker {
            0..=0xfa => Ok(Some(marker as u64)),
            PACKED_NULL => Ok(None),
            0xfc => Ok(Some(self.get_u16()? as u64)),
            0xfd => Ok(Some(self.get_u24()? as u64)),
            0xfe => Ok(Some(self.get_u64()?)),
            0xff => Err(CdcError::BinlogParseError(format!(
                "Invalid packed integer marker 0x{:02x} at {}",
                marker,
                self.position() - 1
            ))),
        }
    }

    /// NULL 이 허용되지 않는 packed integer
    pub fn get_packed_len(&mut self) -> Result<u64> {
        self.get_packed_u64()?.ok_or_else(|| {
            CdcError::BinlogParseError(format!(
                "Unexpected NULL packed length at {}",
                self.position() - 1
            ))
        })
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// 1 byte 길이 + 내용
    pub fn get_length_prefixed_string(&mut self) -> Result<String> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// 고정 길이 영역에서 첫 NUL 이전까지를 문자열로 읽는다.
    pub fn get_fixed_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// NUL 로 끝나는 문자열. 종료 NUL 도 소비한다.
    pub fn get_null_terminated_string(&mut self) -> Result<String> {
        let window = &self.buffer[self.position..self.limit];
        let end = window.iter().position(|&b| b == 0).ok_or_else(|| {
            CdcError::BinlogParseError(format!(
                "Missing string terminator after position {}",
                self.position()
            ))
        })?;
        let value = String::from_utf8_lossy(&window[..end]).into_owned();
        self.position += end + 1;
        Ok(value)
    }

    /// bits 개의 비트를 바이트 단위로 올림해서 읽는다.
    pub fn get_bitmap(&mut self, bits: usize) -> Result<ColumnBitmap> {
        let bytes = self.get_bytes((bits + 7) / 8)?;
        Ok(ColumnBitmap::new(bits, bytes))
    }
}
