//! 메모리 이벤트 스토어
//!
//! 단일 producer 가 put 하고 이름 있는 consumer 들이 각자 get / ack / rollback 한다.
//! 이벤트마다 1 부터 증가하는 시퀀스를 붙이며 cursor 는 시퀀스로 관리한다.
//!
//! - put: 모든 consumer 가 ack 하지 않은 이벤트 수가 capacity 를 넘으면 대기한다.
//! - get: batch_size 만큼 모이거나 timeout 이 지나면 있는 만큼 돌려준다.
//! - interrupt: 대기 중인 put / get 을 `CdcError::Interrupted` 로 깨운다.

use crate::config::StoreConfig;
use crate::error::{CdcError, Result};
use crate::events::LogEvent;
use crate::position::LogPosition;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// 기본 consumer 이름
pub const DEFAULT_CONSUMER: &str = "default";

#[derive(Debug, Clone, Default)]
struct Cursor {
    /// 마지막으로 내보낸 시퀀스
    get_seq: u64,
    /// 마지막으로 ack 된 시퀀스
    ack_seq: u64,
    ack_position: Option<LogPosition>,
}

#[derive(Debug)]
struct StoreState {
    /// events[i] 의 시퀀스 = first_seq + i
    events: VecDeque<LogEvent>,
    first_seq: u64,
    /// 마지막으로 put 된 시퀀스 (0 = 없음)
    put_seq: u64,
    consumers: HashMap<String, Cursor>,
    generation: u64,
}

impl StoreState {
    /// 모든 consumer 가 ack 한 마지막 시퀀스
    fn min_ack(&self) -> u64 {
        self.consumers
            .values()
            .map(|cursor| cursor.ack_seq)
            .min()
            .unwrap_or(self.first_seq - 1)
    }

    fn event(&self, seq: u64) -> &LogEvent {
        &self.events[(seq - self.first_seq) as usize]
    }

    /// 모두 ack 된 앞쪽 이벤트 정리
    fn reclaim(&mut self, until_seq: u64) -> usize {
        let mut reclaimed = 0;
        while self.first_seq <= until_seq && !self.events.is_empty() {
            self.events.pop_front();
            self.first_seq += 1;
            reclaimed += 1;
        }
        reclaimed
    }

    fn has_room(&mut self, count: usize, capacity: usize) -> bool {
        let min_ack = self.min_ack();
        self.reclaim(min_ack);
        (self.put_seq - min_ack) as usize + count <= capacity
    }

    fn cursor_mut(&mut self, consumer: &str) -> Result<&mut Cursor> {
        self.consumers
            .get_mut(consumer)
            .ok_or_else(|| CdcError::StoreError(format!("Unknown consumer: {}", consumer)))
    }

    fn take(&mut self, consumer: &str, batch_size: usize) -> Result<Vec<LogEvent>> {
        let put_seq = self.put_seq;
        let start = self.cursor_mut(consumer)?.get_seq;
        let end = put_seq.min(start + batch_size as u64);

        let batch: Vec<LogEvent> = (start + 1..=end).map(|seq| self.event(seq).clone()).collect();
        self.cursor_mut(consumer)?.get_seq = end;
        Ok(batch)
    }
}

pub struct MemoryEventStore {
    capacity: usize,
    state: Mutex<StoreState>,
    /// producer 대기
    not_full: Notify,
    /// consumer 대기
    not_empty: Notify,
}

impl MemoryEventStore {
    /// 기본 consumer 하나가 등록된 스토어
    pub fn new(config: &StoreConfig) -> Self {
        let store = Self::without_consumers(config.capacity);
        store.subscribe(DEFAULT_CONSUMER);
        store
    }

    pub fn without_consumers(capacity: usize) -> Self {
        MemoryEventStore {
            capacity,
            state: Mutex::new(StoreState {
                events: VecDeque::with_capacity(capacity.min(4096)),
                first_seq: 1,
                put_seq: 0,
                consumers: HashMap::new(),
                generation: 0,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// consumer 등록. 다른 consumer 들이 모두 ack 한 지점부터 읽는다.
    pub fn subscribe(&self, consumer: &str) {
        let mut state = self.state.lock();
        if state.consumers.contains_key(consumer) {
            return;
        }
        let start = state.min_ack();
        let ack_position = (start >= state.first_seq).then(|| state.event(start).position.clone());
        state.consumers.insert(
            consumer.to_string(),
            Cursor {
                get_seq: start,
                ack_seq: start,
                ack_position,
            },
        );
        debug!("Consumer {} subscribed at seq {}", consumer, start);
    }

    pub fn unsubscribe(&self, consumer: &str) {
        let removed = self.state.lock().consumers.remove(consumer).is_some();
        if removed {
            self.not_full.notify_waiters();
        }
    }

    /// 보관 중인 이벤트 수
    pub fn size(&self) -> usize {
        self.state.lock().events.len()
    }

    /// 아직 모든 consumer 가 ack 하지 않은 이벤트 수
    pub fn unacked(&self) -> usize {
        let state = self.state.lock();
        (state.put_seq - state.min_ack()) as usize
    }

    pub fn last_ack_position(&self, consumer: &str) -> Option<LogPosition> {
        self.state
            .lock()
            .consumers
            .get(consumer)
            .and_then(|cursor| cursor.ack_position.clone())
    }

    fn check_batch(&self, count: usize) -> Result<()> {
        if count > self.capacity {
            return Err(CdcError::StoreError(format!(
                "Batch of {} events exceeds store capacity {}",
                count, self.capacity
            )));
        }
        Ok(())
    }

    fn append(state: &mut StoreState, events: Vec<LogEvent>) {
        state.put_seq += events.len() as u64;
        state.events.extend(events);
    }

    /// 공간이 없으면 바로 false
    pub fn try_put(&self, events: Vec<LogEvent>) -> Result<bool> {
        if events.is_empty() {
            return Ok(true);
        }
        self.check_batch(events.len())?;

        {
            let mut state = self.state.lock();
            if !state.has_room(events.len(), self.capacity) {
                return Ok(false);
            }
            Self::append(&mut state, events);
        }
        self.not_empty.notify_waiters();
        Ok(true)
    }

    /// 공간이 생길 때까지 대기
    pub async fn put(&self, events: Vec<LogEvent>) -> Result<()> {
        self.put_until(events, None).await.map(|_| ())
    }

    /// timeout 안에 넣지 못하면 false
    pub async fn put_timeout(&self, events: Vec<LogEvent>, timeout: Duration) -> Result<bool> {
        self.put_until(events, Some(Instant::now() + timeout)).await
    }

    async fn put_until(&self, events: Vec<LogEvent>, deadline: Option<Instant>) -> Result<bool> {
        if events.is_empty() {
            return Ok(true);
        }
        self.check_batch(events.len())?;

        let generation = self.state.lock().generation;
        let mut pending = Some(events);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return Err(CdcError::Interrupted);
                }
                let count = pending.as_ref().map_or(0, Vec::len);
                if state.has_room(count, self.capacity) {
                    if let Some(events) = pending.take() {
                        Self::append(&mut state, events);
                    }
                    drop(state);
                    self.not_empty.notify_waiters();
                    return Ok(true);
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(false);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// batch_size 개가 모일 때까지 최대 timeout 동안 기다린다.
    /// timeout 이 지나면 모인 만큼 (없으면 빈 목록) 돌려준다.
    pub async fn get(&self, consumer: &str, batch_size: usize, timeout: Duration) -> Result<Vec<LogEvent>> {
        let deadline = Instant::now() + timeout;
        let generation = self.state.lock().generation;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return Err(CdcError::Interrupted);
                }
                let delivered = state.cursor_mut(consumer)?.get_seq;
                if state.put_seq - delivered >= batch_size as u64 {
                    return state.take(consumer, batch_size);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return Err(CdcError::Interrupted);
                }
                return state.take(consumer, batch_size);
            }
        }
    }

    /// position 까지 처리 완료
    ///
    /// 이미 지난 위치는 무시한다. 위치가 0 인 표시 이벤트는 이미 내보낸 경우나
    /// 뒤따르는 이벤트가 함께 ack 되는 경우에만 ack 된다.
    /// 아직 내보내지 않은 이벤트까지 ack 하면 get cursor 도 같이 이동한다.
    pub fn ack(&self, consumer: &str, position: &LogPosition) -> Result<()> {
        let advanced = {
            let mut state = self.state.lock();
            let put_seq = state.put_seq;
            let (mut seq, delivered) = {
                let cursor = state.cursor_mut(consumer)?;
                (cursor.ack_seq, cursor.get_seq)
            };
            let mut last_position = None;

            // 표시 이벤트는 이미 내보냈거나 뒤따르는 이벤트가 ack 될 때만 함께 ack 된다
            let mut scan = seq;
            while scan < put_seq {
                scan += 1;
                let event = state.event(scan);
                if event.position.is_sentinel() {
                    if scan <= delivered {
                        seq = scan;
                    }
                    continue;
                }
                if &event.position > position {
                    break;
                }
                last_position = Some(event.position.clone());
                seq = scan;
            }

            let cursor = state.cursor_mut(consumer)?;
            let advanced = seq > cursor.ack_seq;
            if advanced {
                cursor.ack_seq = seq;
                cursor.get_seq = cursor.get_seq.max(seq);
                if last_position.is_some() {
                    cursor.ack_position = last_position;
                }
            }
            advanced
        };

        if advanced {
            self.not_full.notify_waiters();
        }
        Ok(())
    }

    /// get cursor 되돌리기
    ///
    /// - None: 마지막 ack 지점으로
    /// - Some(p): 이미 내보낸 이벤트 중 위치가 p 인 이벤트 다음부터 다시 읽는다.
    ///   p 가 ack 지점 이전이면 ack 지점으로 맞춘다.
    pub fn rollback(&self, consumer: &str, position: Option<&LogPosition>) -> Result<()> {
        {
            let mut state = self.state.lock();
            let cursor = state.cursor_mut(consumer)?.clone();

            let target = match position {
                None => cursor.ack_seq,
                Some(p) if cursor.ack_position.as_ref().map_or(false, |ack| p <= ack) => cursor.ack_seq,
                Some(p) => (cursor.ack_seq + 1..=cursor.get_seq)
                    .rev()
                    .find(|&seq| &state.event(seq).position == p)
                    .ok_or_else(|| {
                        CdcError::StoreError(format!(
                            "Rollback position {} was not delivered to {}",
                            p, consumer
                        ))
                    })?,
            };

            state.cursor_mut(consumer)?.get_seq = target;
            debug!("Consumer {} rolled back to seq {}", consumer, target);
        }
        self.not_empty.notify_waiters();
        Ok(())
    }

    /// 대기 중인 put / get 모두 Interrupted 로 깨운다
    pub fn interrupt(&self) {
        self.state.lock().generation += 1;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    /// position 이전 이벤트 정리. 모든 consumer 가 ack 하지 않았으면 거부한다.
    pub fn clean_until(&self, position: &LogPosition) -> Result<usize> {
        let reclaimed = {
            let mut state = self.state.lock();
            let mut until = state.first_seq - 1;
            for seq in state.first_seq..=state.put_seq {
                let event = state.event(seq);
                if event.position.is_sentinel() {
                    continue;
                }
                if &event.position > position {
                    break;
                }
                until = seq;
            }

            if let Some((name, _)) = state
                .consumers
                .iter()
                .find(|(_, cursor)| cursor.ack_seq < until)
            {
                return Err(CdcError::StoreError(format!(
                    "Cannot clean until {}: not acknowledged by consumer {}",
                    position, name
                )));
            }
            state.reclaim(until)
        };

        if reclaimed > 0 {
            self.not_full.notify_waiters();
        }
        Ok(reclaimed)
    }

    /// 모든 이벤트 삭제. cursor 는 모두 마지막 put 지점으로 이동한다.
    pub fn clean_all(&self) {
        {
            let mut state = self.state.lock();
            let put_seq = state.put_seq;
            state.events.clear();
            state.first_seq = put_seq + 1;
            for cursor in state.consumers.values_mut() {
                cursor.get_seq = put_seq;
                cursor.ack_seq = put_seq;
            }
        }
        info!("Event store cleaned");
        self.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::xid_event;
    use std::sync::Arc;

    const FILE: &str = "mysql-bin.000001";

    fn events(positions: &[u64]) -> Vec<LogEvent> {
        positions.iter().map(|&p| xid_event(FILE, p, 0)).collect()
    }

    fn positions(events: &[LogEvent]) -> Vec<u64> {
        events.iter().map(|e| e.position.position).collect()
    }

    fn store(capacity: usize) -> MemoryEventStore {
        MemoryEventStore::new(&StoreConfig {
            capacity,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_get_after_ack_skips_acked() {
        let store = store(16);
        store.put(events(&[100, 200, 300])).await.unwrap();

        let batch = store.get(DEFAULT_CONSUMER, 2, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&batch), vec![100, 200]);

        store.ack(DEFAULT_CONSUMER, &LogPosition::new(FILE, 200)).unwrap();
        let batch = store.get(DEFAULT_CONSUMER, 10, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&batch), vec![300]);
        assert_eq!(store.last_ack_position(DEFAULT_CONSUMER), Some(LogPosition::new(FILE, 200)));

        // 이미 지난 위치 ack 는 무시
        store.ack(DEFAULT_CONSUMER, &LogPosition::new(FILE, 100)).unwrap();
        assert_eq!(store.last_ack_position(DEFAULT_CONSUMER), Some(LogPosition::new(FILE, 200)));
    }

    #[tokio::test]
    async fn test_ack_beyond_delivered_moves_get_cursor() {
        let store = store(16);
        store.put(events(&[100, 200, 300])).await.unwrap();
        store.get(DEFAULT_CONSUMER, 1, Duration::ZERO).await.unwrap();

        store.ack(DEFAULT_CONSUMER, &LogPosition::new(FILE, 200)).unwrap();
        let batch = store.get(DEFAULT_CONSUMER, 10, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&batch), vec![300]);
    }

    #[tokio::test]
    async fn test_rollback_redelivers_from_ack() {
        let store = store(16);
        store.put(events(&[100, 200, 300, 400])).await.unwrap();
        store.get(DEFAULT_CONSUMER, 1, Duration::ZERO).await.unwrap();
        store.ack(DEFAULT_CONSUMER, &LogPosition::new(FILE, 100)).unwrap();

        let first = store.get(DEFAULT_CONSUMER, 3, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&first), vec![200, 300, 400]);

        store.rollback(DEFAULT_CONSUMER, None).unwrap();
        let again = store.get(DEFAULT_CONSUMER, 3, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&again), positions(&first));

        store.rollback(DEFAULT_CONSUMER, Some(&LogPosition::new(FILE, 300))).unwrap();
        let tail = store.get(DEFAULT_CONSUMER, 3, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&tail), vec![400]);

        // ack 이전 위치는 ack 지점으로
        store.rollback(DEFAULT_CONSUMER, Some(&LogPosition::new(FILE, 50))).unwrap();
        let clamped = store.get(DEFAULT_CONSUMER, 1, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&clamped), vec![200]);

        // 내보내지 않은 위치로는 갈 수 없다
        assert!(store
            .rollback(DEFAULT_CONSUMER, Some(&LogPosition::new(FILE, 999)))
            .is_err());
    }

    #[tokio::test]
    async fn test_put_blocks_until_ack() {
        let store = Arc::new(store(2));
        store.put(events(&[100, 200])).await.unwrap();
        assert!(!store.try_put(events(&[300])).unwrap());

        let producer = {
            let store = store.clone();
            tokio::spawn(async move { store.put(events(&[300])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        let batch = store.get(DEFAULT_CONSUMER, 1, Duration::ZERO).await.unwrap();
        store.ack(DEFAULT_CONSUMER, &batch[0].position).unwrap();

        tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let rest = store.get(DEFAULT_CONSUMER, 2, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&rest), vec![200, 300]);
    }

    #[tokio::test]
    async fn test_put_timeout_and_oversized_batch() {
        let store = store(2);
        store.put(events(&[100, 200])).await.unwrap();
        let accepted = store
            .put_timeout(events(&[300]), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!accepted);
        assert!(matches!(
            store.put(events(&[1, 2, 3])).await,
            Err(CdcError::StoreError(_))
        ));
    }

    #[tokio::test]
    async fn test_get_times_out_with_partial_batch() {
        let store = store(16);
        store.put(events(&[100])).await.unwrap();
        let batch = store
            .get(DEFAULT_CONSUMER, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(positions(&batch), vec![100]);
    }

    #[tokio::test]
    async fn test_interrupt_wakes_waiting_consumer() {
        let store = Arc::new(store(16));
        let consumer = {
            let store = store.clone();
            tokio::spawn(async move { store.get(DEFAULT_CONSUMER, 1, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.interrupt();
        let result = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CdcError::Interrupted)));

        // 인터럽트 이후의 호출은 정상 동작
        store.put(events(&[100])).await.unwrap();
        let batch = store.get(DEFAULT_CONSUMER, 1, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_clean_until_requires_all_acks() {
        let store = store(16);
        store.subscribe("other");
        store.put(events(&[100, 200, 300])).await.unwrap();

        store.get(DEFAULT_CONSUMER, 3, Duration::ZERO).await.unwrap();
        store.ack(DEFAULT_CONSUMER, &LogPosition::new(FILE, 200)).unwrap();
        assert!(store.clean_until(&LogPosition::new(FILE, 200)).is_err());

        store.get("other", 3, Duration::ZERO).await.unwrap();
        store.ack("other", &LogPosition::new(FILE, 300)).unwrap();
        assert_eq!(store.clean_until(&LogPosition::new(FILE, 200)).unwrap(), 2);
        assert_eq!(store.size(), 1);

        store.clean_all();
        assert_eq!(store.size(), 0);
        assert_eq!(store.unacked(), 0);
    }

    #[tokio::test]
    async fn test_sentinel_events_carried_by_ack() {
        let store = store(16);
        let mut batch = events(&[100]);
        batch.push(xid_event("mysql-bin.000002", 0, 0));
        batch.extend(events(&[300]));
        store.put(batch).await.unwrap();

        store.get(DEFAULT_CONSUMER, 3, Duration::ZERO).await.unwrap();
        store.ack(DEFAULT_CONSUMER, &LogPosition::new(FILE, 100)).unwrap();
        assert_eq!(store.unacked(), 1);
        assert_eq!(store.last_ack_position(DEFAULT_CONSUMER), Some(LogPosition::new(FILE, 100)));
    }

    fn batch_with_rotate() -> Vec<LogEvent> {
        let mut batch = events(&[100]);
        batch.push(LogEvent::synthetic_rotate("mysql-bin.000002"));
        batch.push(xid_event("mysql-bin.000002", 300, 0));
        batch
    }

    fn names(events: &[LogEvent]) -> Vec<String> {
        events.iter().map(|e| e.position.to_string()).collect()
    }

    #[tokio::test]
    async fn test_undelivered_rotate_survives_ack() {
        let store = store(16);
        store.put(batch_with_rotate()).await.unwrap();

        let first = store.get(DEFAULT_CONSUMER, 1, Duration::ZERO).await.unwrap();
        assert_eq!(positions(&first), vec![100]);
        store.ack(DEFAULT_CONSUMER, &first[0].position).unwrap();
        assert_eq!(store.unacked(), 2);

        let rest = store.get(DEFAULT_CONSUMER, 10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest[0].position.is_sentinel());
        assert_eq!(rest[1].position, LogPosition::new("mysql-bin.000002", 300));

        store.ack(DEFAULT_CONSUMER, &rest[1].position).unwrap();
        assert_eq!(store.unacked(), 0);
    }

    #[tokio::test]
    async fn test_rollback_redelivers_rotate_after_ack() {
        let store = store(16);
        store.put(batch_with_rotate()).await.unwrap();

        let first = store.get(DEFAULT_CONSUMER, 1, Duration::ZERO).await.unwrap();
        store.ack(DEFAULT_CONSUMER, &first[0].position).unwrap();

        let delivered = store.get(DEFAULT_CONSUMER, 10, Duration::ZERO).await.unwrap();
        assert_eq!(delivered.len(), 2);

        store.rollback(DEFAULT_CONSUMER, None).unwrap();
        let again = store.get(DEFAULT_CONSUMER, 10, Duration::ZERO).await.unwrap();
        assert_eq!(names(&again), names(&delivered));
    }

    #[tokio::test]
    async fn test_clean_until_keeps_trailing_rotate() {
        let store = store(16);
        store.put(batch_with_rotate()).await.unwrap();

        let first = store.get(DEFAULT_CONSUMER, 1, Duration::ZERO).await.unwrap();
        store.ack(DEFAULT_CONSUMER, &first[0].position).unwrap();
        assert_eq!(store.clean_until(&first[0].position).unwrap(), 1);

        let rest = store.get(DEFAULT_CONSUMER, 10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest[0].position.is_sentinel());
    }
}
