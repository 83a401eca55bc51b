//! 하트비트 기반 HA 전환

use crate::config::HaConfig;
use crate::connection::{MySqlConnection, SourceEndpoint};
use crate::error::{CdcError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 주/예비 서버 전환이 가능한 대상
#[async_trait]
pub trait HaSwitchable: Send + Sync {
    /// 다음 예비 서버로 전환
    async fn switchover(&self) -> Result<()>;

    /// 지정한 서버로 전환
    async fn switchover_to(&self, endpoint: SourceEndpoint) -> Result<()>;
}

#[async_trait]
pub trait HeartbeatCallback: Send + Sync {
    async fn on_success(&self, elapsed: Duration);

    async fn on_failed(&self, error: &CdcError);
}

/// 주 서버와 예비 서버 목록
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaEndpoints {
    master: SourceEndpoint,
    standby: Option<SourceEndpoint>,
    using_master: bool,
}

impl HaEndpoints {
    pub fn new(master: SourceEndpoint, standby: Option<SourceEndpoint>) -> Self {
        HaEndpoints {
            master,
            standby,
            using_master: true,
        }
    }

    pub fn current(&self) -> &SourceEndpoint {
        match (&self.standby, self.using_master) {
            (Some(standby), false) => standby,
            _ => &self.master,
        }
    }

    pub fn is_using_master(&self) -> bool {
        self.using_master || self.standby.is_none()
    }

    /// 반대편 서버로 전환. 예비 서버가 없으면 그대로.
    pub fn switch(&mut self) -> &SourceEndpoint {
        if self.standby.is_some() {
            self.using_master = !self.using_master;
        }
        self.current()
    }

    /// 지정한 서버를 현재 서버로. 기존 현재 서버는 예비가 된다.
    pub fn switch_to(&mut self, endpoint: SourceEndpoint) -> &SourceEndpoint {
        if endpoint == self.master {
            self.using_master = true;
        } else if self.standby.as_ref() == Some(&endpoint) {
            self.using_master = false;
        } else {
            let previous = self.current().clone();
            self.master = endpoint;
            self.standby = Some(previous);
            self.using_master = true;
        }
        self.current()
    }
}

/// 연속 실패 횟수가 기준에 도달하면 전환한다
pub struct HeartbeatHaController {
    config: HaConfig,
    failed_times: AtomicU32,
    switchable: Arc<dyn HaSwitchable>,
    /// 전환은 한 번에 하나
    switching: Mutex<()>,
}

impl HeartbeatHaController {
    pub fn new(config: HaConfig, switchable: Arc<dyn HaSwitchable>) -> Self {
        HeartbeatHaController {
            config,
            failed_times: AtomicU32::new(0),
            switchable,
            switching: Mutex::new(()),
        }
    }

    pub fn failed_times(&self) -> u32 {
        self.failed_times.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeartbeatCallback for HeartbeatHaController {
    async fn on_success(&self, elapsed: Duration) {
        self.failed_times.store(0, Ordering::SeqCst);
        debug!("Heartbeat succeeded in {:?}", elapsed);
    }

    async fn on_failed(&self, error: &CdcError) {
        let failed = self.failed_times.fetch_add(1, Ordering::SeqCst) + 1;
        warn!("Heartbeat failed ({} times): {}", failed, error);
        if failed < self.config.detecting_retry_times {
            return;
        }

        let _guard = self.switching.lock().await;
        let failed = self.failed_times.load(Ordering::SeqCst);
        if failed < self.config.detecting_retry_times {
            // 다른 호출이 이미 전환했다
            return;
        }

        if !self.config.switch_enable {
            error!(
                "Heartbeat failed {} times but automatic switch is disabled",
                failed
            );
            return;
        }

        info!("Heartbeat failed {} times, switching source", failed);
        match self.switchable.switchover().await {
            Ok(()) => self.failed_times.store(0, Ordering::SeqCst),
            Err(e) => error!("Switchover failed: {}", e),
        }
    }
}

/// 소스 liveness 확인
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// MySQL ping 으로 liveness 를 확인한다. 연결은 재사용하고 실패하면 버린다.
pub struct MySqlLivenessProbe {
    endpoint: SourceEndpoint,
    conn: Mutex<Option<MySqlConnection>>,
}

impl MySqlLivenessProbe {
    pub fn new(endpoint: SourceEndpoint) -> Self {
        MySqlLivenessProbe {
            endpoint,
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LivenessProbe for MySqlLivenessProbe {
    async fn probe(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => MySqlConnection::connect(&self.endpoint).await?,
        };
        conn.ping().await?;
        *slot = Some(conn);
        Ok(())
    }
}

/// interval 마다 probe 하고 결과를 callback 에 알린다
pub fn spawn_heartbeat(
    probe: Arc<dyn LivenessProbe>,
    callback: Arc<dyn HeartbeatCallback>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let started = Instant::now();
            match probe.probe().await {
                Ok(()) => callback.on_success(started.elapsed()).await,
                Err(e) => callback.on_failed(&e).await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct CountingSwitchable {
        switches: AtomicU32,
    }

    #[async_trait]
    impl HaSwitchable for CountingSwitchable {
        async fn switchover(&self) -> Result<()> {
            self.switches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn switchover_to(&self, _endpoint: SourceEndpoint) -> Result<()> {
            self.switchover().await
        }
    }

    fn controller(switch_enable: bool) -> (HeartbeatHaController, Arc<CountingSwitchable>) {
        let switchable = Arc::new(CountingSwitchable::default());
        let config = HaConfig {
            detecting_retry_times: 3,
            switch_enable,
            ..Default::default()
        };
        (HeartbeatHaController::new(config, switchable.clone()), switchable)
    }

    fn failure() -> CdcError {
        CdcError::ConnectionError("probe failed".to_string())
    }

    #[tokio::test]
    async fn test_three_failures_switch_once() {
        let (controller, switchable) = controller(true);
        for _ in 0..3 {
            controller.on_failed(&failure()).await;
        }
        assert_eq!(switchable.switches.load(Ordering::SeqCst), 1);
        assert_eq!(controller.failed_times(), 0);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (controller, switchable) = controller(true);
        controller.on_failed(&failure()).await;
        controller.on_failed(&failure()).await;
        controller.on_success(Duration::from_millis(1)).await;
        assert_eq!(controller.failed_times(), 0);

        controller.on_failed(&failure()).await;
        assert_eq!(switchable.switches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_switch_disabled_only_logs() {
        let (controller, switchable) = controller(false);
        for _ in 0..5 {
            controller.on_failed(&failure()).await;
        }
        assert_eq!(switchable.switches.load(Ordering::SeqCst), 0);
        assert_eq!(controller.failed_times(), 5);
    }

    #[test]
    fn test_endpoints_switch() {
        let master = SourceEndpoint::new("db1", "canal");
        let standby = SourceEndpoint::new("db2", "canal");
        let mut endpoints = HaEndpoints::new(master.clone(), Some(standby.clone()));
        assert_eq!(endpoints.current(), &master);
        assert_eq!(endpoints.switch(), &standby);
        assert!(!endpoints.is_using_master());
        assert_eq!(endpoints.switch(), &master);

        let other = SourceEndpoint::new("db3", "canal");
        assert_eq!(endpoints.switch_to(other.clone()), &other);
        assert_eq!(endpoints.switch(), &master);

        let mut single = HaEndpoints::new(master.clone(), None);
        assert_eq!(single.switch(), &master);
    }

    struct FlakyProbe {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl LivenessProbe for FlakyProbe {
        async fn probe(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(failure())
            }
        }
    }

    #[tokio::test]
    async fn test_heartbeat_task_drives_controller() {
        let (controller, switchable) = controller(true);
        let controller = Arc::new(controller);
        let probe = Arc::new(FlakyProbe {
            healthy: AtomicBool::new(false),
        });

        let task = spawn_heartbeat(probe, controller.clone(), Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(5), async {
            while switchable.switches.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        task.abort();
    }
}
