//! 여러 parser 가 하나의 스토어로 이벤트를 넣을 때의 진입 제어

use crate::error::{CdcError, Result};
use crate::events::LogEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[async_trait]
pub trait GroupBarrier: Send + Sync {
    /// 이벤트가 진입 허가될 때까지 대기
    async fn wait(&self, event: &LogEvent) -> Result<()>;

    /// timeout 안에 허가되지 않으면 `CdcError::Timeout`
    async fn wait_timeout(&self, event: &LogEvent, timeout: Duration) -> Result<()>;

    /// 이벤트가 스토어에 들어간 뒤 호출
    fn clear(&self, event: &LogEvent);

    /// 허가받은 이벤트를 스토어에 넣지 못했을 때 호출. 대기 자리만 반납한다.
    fn cancel(&self, event: &LogEvent);

    /// 대기 중인 모든 producer 를 진입시키지 않고 깨운다
    fn interrupt(&self);
}

/// 순서 제약 없이 바로 통과
#[derive(Debug, Default)]
pub struct PassthroughBarrier;

#[async_trait]
impl GroupBarrier for PassthroughBarrier {
    async fn wait(&self, _event: &LogEvent) -> Result<()> {
        Ok(())
    }

    async fn wait_timeout(&self, _event: &LogEvent, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn clear(&self, _event: &LogEvent) {}

    fn cancel(&self, _event: &LogEvent) {}

    fn interrupt(&self) {}
}

#[derive(Debug, Default)]
struct TimelineState {
    /// 대기 중인 이벤트 타임스탬프 (값 -> 개수)
    pending: BTreeMap<u64, usize>,
    pending_count: usize,
    /// 마지막으로 스토어에 들어간 이벤트 타임스탬프
    threshold: u64,
    generation: u64,
}

impl TimelineState {
    fn add(&mut self, timestamp: u64) {
        *self.pending.entry(timestamp).or_insert(0) += 1;
        self.pending_count += 1;
    }

    fn remove(&mut self, timestamp: u64) -> bool {
        let Some(count) = self.pending.get_mut(&timestamp) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.pending.remove(&timestamp);
        }
        self.pending_count -= 1;
        true
    }

    /// 그룹 전원이 이벤트를 올려 두었고 그중 가장 이른 타임스탬프일 때만 허가
    fn is_permit(&self, timestamp: u64, group_size: usize) -> bool {
        if self.pending_count < group_size {
            return false;
        }
        self.pending
            .keys()
            .next()
            .map_or(false, |&earliest| timestamp <= earliest)
    }
}

/// 이벤트 타임스탬프 순으로 여러 producer 의 이벤트를 합친다
///
/// 그룹 구성원 모두가 이벤트를 하나씩 올려 두어야 가장 이른 이벤트가 통과한다.
/// 이미 스토어에 들어간 시각보다 이른 이벤트는 기다리지 않는다.
pub struct TimelineBarrier {
    group_size: usize,
    state: Mutex<TimelineState>,
    changed: Notify,
}

impl TimelineBarrier {
    pub fn new(group_size: usize) -> Self {
        TimelineBarrier {
            group_size: group_size.max(1),
            state: Mutex::new(TimelineState::default()),
            changed: Notify::new(),
        }
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// 허가를 기다리거나 허가받고 아직 clear 되지 않은 이벤트 수
    pub fn pending(&self) -> usize {
        self.state.lock().pending_count
    }

    fn timestamp(event: &LogEvent) -> u64 {
        event.header.when as u64
    }

    async fn wait_until(&self, event: &LogEvent, deadline: Option<Instant>) -> Result<()> {
        let timestamp = Self::timestamp(event);
        let generation = {
            let mut state = self.state.lock();
            if timestamp <= state.threshold {
                return Ok(());
            }
            state.add(timestamp);
            state.generation
        };
        // 새 타임스탬프로 다른 대기자의 허가 조건이 바뀔 수 있다
        self.changed.notify_waiters();

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.generation != generation {
                    return Err(CdcError::Interrupted);
                }
                if state.is_permit(timestamp, self.group_size) {
                    return Ok(());
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let removed = {
                            let mut state = self.state.lock();
                            state.generation == generation && state.remove(timestamp)
                        };
                        if removed {
                            self.changed.notify_waiters();
                        }
                        return Err(CdcError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait]
impl GroupBarrier for TimelineBarrier {
    async fn wait(&self, event: &LogEvent) -> Result<()> {
        self.wait_until(event, None).await
    }

    async fn wait_timeout(&self, event: &LogEvent, timeout: Duration) -> Result<()> {
        self.wait_until(event, Some(Instant::now() + timeout)).await
    }

    fn clear(&self, event: &LogEvent) {
        let timestamp = Self::timestamp(event);
        {
            let mut state = self.state.lock();
            state.remove(timestamp);
            state.threshold = state.threshold.max(timestamp);
        }
        self.changed.notify_waiters();
    }

    fn cancel(&self, event: &LogEvent) {
        let removed = self.state.lock().remove(Self::timestamp(event));
        if removed {
            self.changed.notify_waiters();
        }
    }

    fn interrupt(&self) {
        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.pending.clear();
            state.pending_count = 0;
        }
        debug!("Timeline barrier interrupted");
        self.changed.notify_waiters();
    }
}
