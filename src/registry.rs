//! destination 별 실행 상태 레지스트리
//!
//! 상위 supervisor 가 시작할 때 만들고 종료할 때 `shutdown` 한다.
//! 조회가 필요한 컴포넌트에는 `Arc<RunningRegistry>` 를 넘긴다.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// destination 을 실행 중인 인스턴스 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRunningData {
    /// 실행 인스턴스 식별자 (e.g., "host:port")
    pub address: String,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

impl ServerRunningData {
    pub fn new(address: impl Into<String>) -> Self {
        ServerRunningData {
            address: address.into(),
            active: true,
            started_at: Utc::now(),
        }
    }
}

/// 한 destination 의 실행 권한
///
/// 한 번에 하나의 인스턴스만 active 상태가 된다.
#[derive(Debug)]
pub struct RunningMonitor {
    destination: String,
    running: Mutex<Option<ServerRunningData>>,
    released: Notify,
}

impl RunningMonitor {
    fn new(destination: &str) -> Self {
        RunningMonitor {
            destination: destination.to_string(),
            running: Mutex::new(None),
            released: Notify::new(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// 실행 권한 획득 시도. 이미 다른 인스턴스가 active 면 false.
    pub fn try_start(&self, data: ServerRunningData) -> bool {
        let mut running = self.running.lock();
        match running.as_ref() {
            Some(current) if current.active && current.address != data.address => false,
            _ => {
                info!("{} is now running on {}", self.destination, data.address);
                *running = Some(data);
                true
            }
        }
    }

    /// 실행 권한을 얻을 때까지 대기
    pub async fn start(&self, data: ServerRunningData) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_start(data.clone()) {
                return;
            }
            notified.await;
        }
    }

    /// address 가 가진 실행 권한을 반납
    pub fn release(&self, address: &str) {
        let released = {
            let mut running = self.running.lock();
            match running.as_ref() {
                Some(current) if current.address == address => {
                    *running = None;
                    true
                }
                _ => false,
            }
        };
        if released {
            info!("{} released by {}", self.destination, address);
            self.released.notify_waiters();
        }
    }

    pub fn running_data(&self) -> Option<ServerRunningData> {
        self.running.lock().clone()
    }

    pub fn is_active(&self, address: &str) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |data| data.active && data.address == address)
    }

    fn stop(&self) {
        self.running.lock().take();
        self.released.notify_waiters();
    }
}

#[derive(Debug, Default)]
pub struct RunningRegistry {
    monitors: RwLock<HashMap<String, Arc<RunningMonitor>>>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monitor(&self, destination: &str) -> Arc<RunningMonitor> {
        if let Some(monitor) = self.monitors.read().get(destination) {
            return monitor.clone();
        }
        self.monitors
            .write()
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(RunningMonitor::new(destination)))
            .clone()
    }

    pub fn get(&self, destination: &str) -> Option<Arc<RunningMonitor>> {
        self.monitors.read().get(destination).cloned()
    }

    pub fn remove(&self, destination: &str) -> Option<Arc<RunningMonitor>> {
        let removed = self.monitors.write().remove(destination);
        if let Some(monitor) = &removed {
            monitor.stop();
        }
        removed
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.monitors.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// 모든 monitor 를 정지하고 비운다
    pub fn shutdown(&self) {
        let monitors: Vec<Arc<RunningMonitor>> =
            self.monitors.write().drain().map(|(_, monitor)| monitor).collect();
        for monitor in &monitors {
            monitor.stop();
        }
        info!("Running registry shut down ({} destinations)", monitors.len());
    }
}
