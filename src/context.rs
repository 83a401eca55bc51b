//! 디코딩 컨텍스트
//!
//! 현재 포맷 정보, table_id -> 테이블 맵, 현재 위치를 보관한다.
//! 하나의 스트림 전용이며 스레드 간에 공유하지 않는다.

use crate::events::{FormatDescription, TableMapEvent};
use crate::position::LogPosition;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct LogContext {
    format_description: FormatDescription,
    tables: HashMap<u64, Arc<TableMapEvent>>,
    position: Option<LogPosition>,
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format_description(format_description: FormatDescription) -> Self {
        LogContext {
            format_description,
            ..Default::default()
        }
    }

    pub fn format_description(&self) -> &FormatDescription {
        &self.format_description
    }

    pub fn set_format_description(&mut self, format_description: FormatDescription) {
        self.format_description = format_description;
    }

    pub fn position(&self) -> Option<&LogPosition> {
        self.position.as_ref()
    }

    pub fn set_position(&mut self, position: LogPosition) {
        self.position = Some(position);
    }

    /// 같은 table_id 가 재사용되면 새 매핑이 이긴다
    pub fn put_table(&mut self, table: Arc<TableMapEvent>) {
        self.tables.insert(table.table_id, table);
    }

    pub fn table(&self, table_id: u64) -> Option<&Arc<TableMapEvent>> {
        self.tables.get(&table_id)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn clear_all_tables(&mut self) {
        self.tables.clear();
    }

    /// 재연결 시 호출. 포맷은 기본값으로, 테이블 맵은 모두 비운다.
    pub fn reset(&mut self) {
        self.format_description = FormatDescription::default();
        self.tables.clear();
    }
}
