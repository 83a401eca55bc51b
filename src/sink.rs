//! parser 와 스토어 사이의 sink

use crate::barrier::GroupBarrier;
use crate::error::Result;
use crate::events::LogEvent;
use crate::store::MemoryEventStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

#[async_trait]
pub trait EventSink: Send + Sync {
    /// 이벤트 묶음을 스토어로 넘긴다. 모두 들어간 뒤에 반환한다.
    async fn sink(&self, events: Vec<LogEvent>, destination: &str) -> Result<()>;

    /// 대기 중인 sink 호출을 중단시킨다
    fn interrupt(&self);
}

/// 외부 필터. 스토어 get 이후 소비자 쪽에서 적용한다.
pub trait EventFilter: Send + Sync {
    fn filter(&self, event: &LogEvent) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(&LogEvent) -> bool + Send + Sync,
{
    fn filter(&self, event: &LogEvent) -> bool {
        self(event)
    }
}

/// 하트비트를 걸러내고 스토어에 넣는다
pub struct EntryEventSink {
    store: Arc<MemoryEventStore>,
}

impl EntryEventSink {
    pub fn new(store: Arc<MemoryEventStore>) -> Self {
        EntryEventSink { store }
    }

    pub fn store(&self) -> &Arc<MemoryEventStore> {
        &self.store
    }
}

fn without_heartbeats(events: Vec<LogEvent>) -> Vec<LogEvent> {
    events.into_iter().filter(|event| !event.is_heartbeat()).collect()
}

#[async_trait]
impl EventSink for EntryEventSink {
    async fn sink(&self, events: Vec<LogEvent>, destination: &str) -> Result<()> {
        let events = without_heartbeats(events);
        if events.is_empty() {
            return Ok(());
        }
        trace!("Sinking {} events for {}", events.len(), destination);
        self.store.put(events).await
    }

    fn interrupt(&self) {
        self.store.interrupt();
    }
}

/// 여러 parser 가 공유하는 sink. 이벤트마다 barrier 를 통과해야 스토어에 들어간다.
pub struct GroupEventSink {
    store: Arc<MemoryEventStore>,
    barrier: Arc<dyn GroupBarrier>,
}

impl GroupEventSink {
    pub fn new(store: Arc<MemoryEventStore>, barrier: Arc<dyn GroupBarrier>) -> Self {
        GroupEventSink { store, barrier }
    }
}

#[async_trait]
impl EventSink for GroupEventSink {
    async fn sink(&self, events: Vec<LogEvent>, destination: &str) -> Result<()> {
        for event in without_heartbeats(events) {
            self.barrier.wait(&event).await?;
            let admitted = event.clone();
            if let Err(e) = self.store.put(vec![event]).await {
                self.barrier.cancel(&admitted);
                return Err(e);
            }
            self.barrier.clear(&admitted);
        }
        debug!("Group sink admitted events for {}", destination);
        Ok(())
    }

    fn interrupt(&self) {
        self.barrier.interrupt();
        self.store.interrupt();
    }
}
