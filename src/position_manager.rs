//! destination 별 처리 위치 저장
//!
//! - `MemoryLogPositionManager`: 프로세스 메모리. 재시작하면 사라진다.
//! - `RemoteLogPositionManager`: 외부 key/value 저장소 (`PositionStorage`).
//! - `FailbackLogPositionManager`: primary 실패 시 secondary.
//! - `MixedLogPositionManager`: 메모리 동기 쓰기 + 원격 비동기 쓰기.

use crate::error::{CdcError, Result};
use crate::position::LogPosition;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait LogPositionManager: Send + Sync {
    async fn get_latest_position(&self, destination: &str) -> Result<Option<LogPosition>>;

    async fn persist_log_position(&self, destination: &str, position: &LogPosition) -> Result<()>;
}

/// 메모리 위치 저장
#[derive(Debug, Default)]
pub struct MemoryLogPositionManager {
    positions: RwLock<HashMap<String, LogPosition>>,
}

impl MemoryLogPositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self.positions.read().keys().cloned().collect();
        destinations.sort();
        destinations
    }

    pub fn get(&self, destination: &str) -> Option<LogPosition> {
        self.positions.read().get(destination).cloned()
    }

    pub fn put(&self, destination: &str, position: LogPosition) {
        self.positions.write().insert(destination.to_string(), position);
    }
}

#[async_trait]
impl LogPositionManager for MemoryLogPositionManager {
    async fn get_latest_position(&self, destination: &str) -> Result<Option<LogPosition>> {
        Ok(self.get(destination))
    }

    async fn persist_log_position(&self, destination: &str, position: &LogPosition) -> Result<()> {
        self.put(destination, position.clone());
        Ok(())
    }
}

/// 불투명 key/value 저장소
#[async_trait]
pub trait PositionStorage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn write(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// 디렉토리 기반 저장소. key 의 '/' 는 하위 디렉토리가 된다.
#[derive(Debug, Clone)]
pub struct FilePositionStorage {
    root: PathBuf,
}

impl FilePositionStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilePositionStorage { root: root.into() }
    }

    fn path_of(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty() && *part != "..")
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

#[async_trait]
impl PositionStorage for FilePositionStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_of(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CdcError::PositionError(format!("Failed to read {}: {}", key, e))),
        }
    }

    /// 임시 파일에 쓴 뒤 rename 한다
    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| CdcError::PositionError(format!("Failed to write {}: {}", key, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CdcError::PositionError(format!("Failed to rename {}: {}", key, e)))?;
        Ok(())
    }
}

/// 원격 저장소에 JSON 으로 저장. key = "<root>/<destination>"
pub struct RemoteLogPositionManager {
    storage: Arc<dyn PositionStorage>,
    root: String,
}

impl RemoteLogPositionManager {
    pub fn new(storage: Arc<dyn PositionStorage>, root: impl Into<String>) -> Self {
        RemoteLogPositionManager {
            storage,
            root: root.into(),
        }
    }

    /// 파일 저장소를 쓰는 원격 manager
    pub fn with_directory(dir: impl AsRef<Path>) -> Self {
        Self::new(
            Arc::new(FilePositionStorage::new(dir.as_ref())),
            "positions",
        )
    }

    fn key(&self, destination: &str) -> String {
        format!("{}/{}", self.root, destination)
    }
}

#[async_trait]
impl LogPositionManager for RemoteLogPositionManager {
    async fn get_latest_position(&self, destination: &str) -> Result<Option<LogPosition>> {
        match self.storage.read(&self.key(destination)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn persist_log_position(&self, destination: &str, position: &LogPosition) -> Result<()> {
        let data = serde_json::to_vec(position)?;
        self.storage.write(&self.key(destination), &data).await
    }
}

/// primary 가 실패하면 secondary 로 대체
pub struct FailbackLogPositionManager {
    primary: Arc<dyn LogPositionManager>,
    secondary: Arc<dyn LogPositionManager>,
}

impl FailbackLogPositionManager {
    pub fn new(primary: Arc<dyn LogPositionManager>, secondary: Arc<dyn LogPositionManager>) -> Self {
        FailbackLogPositionManager { primary, secondary }
    }
}

#[async_trait]
impl LogPositionManager for FailbackLogPositionManager {
    async fn get_latest_position(&self, destination: &str) -> Result<Option<LogPosition>> {
        match self.primary.get_latest_position(destination).await {
            Ok(Some(position)) => Ok(Some(position)),
            Ok(None) => self.secondary.get_latest_position(destination).await,
            Err(e) => {
                warn!(
                    "Primary position manager read failed for {}, trying secondary: {}",
                    destination, e
                );
                self.secondary.get_latest_position(destination).await
            }
        }
    }

    async fn persist_log_position(&self, destination: &str, position: &LogPosition) -> Result<()> {
        match self.primary.persist_log_position(destination, position).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "Primary position manager persist failed for {} at {}, falling back: {}",
                    destination, position, e
                );
                self.secondary.persist_log_position(destination, position).await
            }
        }
    }
}

enum MixedCommand {
    Persist {
        destination: String,
        position: LogPosition,
    },
    Flush(oneshot::Sender<()>),
}

/// 메모리 + 원격 조합
///
/// 원격 쓰기는 단일 worker 가 제출 순서대로 처리한다. 프로세스가 큐를 비우기 전에
/// 종료되면 마지막 몇 개의 원격 쓰기는 사라질 수 있다 (메모리에는 남는다).
pub struct MixedLogPositionManager {
    memory: MemoryLogPositionManager,
    remote: Arc<dyn LogPositionManager>,
    sender: Mutex<Option<mpsc::UnboundedSender<MixedCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MixedLogPositionManager {
    /// tokio 런타임 안에서 호출해야 한다 (worker 를 spawn 한다)
    pub fn new(remote: Arc<dyn LogPositionManager>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run_worker(remote.clone(), receiver));

        MixedLogPositionManager {
            memory: MemoryLogPositionManager::new(),
            remote,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run_worker(
        remote: Arc<dyn LogPositionManager>,
        mut receiver: mpsc::UnboundedReceiver<MixedCommand>,
    ) {
        while let Some(command) = receiver.recv().await {
            match command {
                MixedCommand::Persist {
                    destination,
                    position,
                } => {
                    if let Err(e) = remote.persist_log_position(&destination, &position).await {
                        error!(
                            "Remote persist failed for {} at {}: {}",
                            destination, position, e
                        );
                    }
                }
                MixedCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Mixed position manager worker stopped");
    }

    /// 지금까지 제출된 원격 쓰기가 끝날 때까지 기다린다
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        {
            let sender = self.sender.lock();
            let sender = sender.as_ref().ok_or(CdcError::ChannelClosed)?;
            sender
                .send(MixedCommand::Flush(done))
                .map_err(|_| CdcError::ChannelClosed)?;
        }
        wait.await.map_err(|_| CdcError::ChannelClosed)
    }

    /// 큐를 닫고 남은 쓰기를 처리한 뒤 worker 를 종료한다
    pub async fn shutdown(&self) -> Result<()> {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker
                .await
                .map_err(|e| CdcError::Other(format!("Position worker panicked: {}", e)))?;
            info!("Mixed position manager shut down");
        }
        Ok(())
    }
}

#[async_trait]
impl LogPositionManager for MixedLogPositionManager {
    async fn get_latest_position(&self, destination: &str) -> Result<Option<LogPosition>> {
        if let Some(position) = self.memory.get(destination) {
            return Ok(Some(position));
        }

        let position = self.remote.get_latest_position(destination).await?;
        if let Some(position) = &position {
            self.memory.put(destination, position.clone());
        }
        Ok(position)
    }

    async fn persist_log_position(&self, destination: &str, position: &LogPosition) -> Result<()> {
        self.memory.put(destination, position.clone());

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                let command = MixedCommand::Persist {
                    destination: destination.to_string(),
                    position: position.clone(),
                };
                if sender.send(command).is_err() {
                    warn!("Remote position queue closed, {} kept in memory only", position);
                }
            }
            None => warn!("Mixed position manager is shut down, {} kept in memory only", position),
        }
        Ok(())
    }
}
