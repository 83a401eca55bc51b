//! 로컬 binlog 파일 목록 관리
//!
//! 디렉토리에서 `<base_name><숫자>` 형태의 파일을 찾아 이름순으로 유지하고,
//! 주기적으로 다시 스캔해서 새 파일이 생기면 대기 중인 쪽을 깨운다.

use crate::config::FileQueueConfig;
use crate::error::{CdcError, Result};
use crate::position::file_sequence;
use parking_lot::Mutex;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 시퀀스 번호가 비어 있는 동안 경고를 다시 남기는 간격
const GAP_WARN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct QueueState {
    /// 정렬된 파일명
    binlogs: Vec<String>,
    destroyed: bool,
}

pub struct BinlogFileQueue {
    directory: PathBuf,
    pattern: Regex,
    state: Mutex<QueueState>,
    next_file: Notify,
    reload_task: Mutex<Option<JoinHandle<()>>>,
}

impl BinlogFileQueue {
    /// 디렉토리를 스캔하고 주기적 재스캔을 시작한다
    pub async fn open(config: &FileQueueConfig) -> Result<Arc<Self>> {
        let metadata = tokio::fs::metadata(&config.directory).await.map_err(|e| {
            CdcError::IoError(format!(
                "Binlog directory missing or unreadable: {}: {}",
                config.directory.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(CdcError::IoError(format!(
                "Binlog directory is not a directory: {}",
                config.directory.display()
            )));
        }

        let pattern = Regex::new(&format!(r"^{}\d+$", regex::escape(&config.base_name)))
            .map_err(|e| CdcError::Other(format!("Invalid binlog base name: {}", e)))?;

        let queue = Arc::new(BinlogFileQueue {
            directory: config.directory.clone(),
            pattern,
            state: Mutex::new(QueueState::default()),
            next_file: Notify::new(),
            reload_task: Mutex::new(None),
        });
        queue.reload().await?;

        let weak = Arc::downgrade(&queue);
        let interval = config.reload_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(queue) = Weak::upgrade(&weak) else {
                    break;
                };
                if let Err(e) = queue.reload().await {
                    warn!("Failed to rescan binlog directory: {}", e);
                }
            }
        });
        *queue.reload_task.lock() = Some(task);

        info!("Binlog file queue opened on {}", config.directory.display());
        Ok(queue)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_of(&self, file_name: &str) -> PathBuf {
        self.directory.join(file_name)
    }

    /// 즉시 재스캔. 새로 발견한 파일이 있으면 대기자를 깨운다.
    pub async fn reload(&self) -> Result<()> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if self.pattern.is_match(name) {
                    found.push(name.to_string());
                }
            }
        }

        let mut added = 0;
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Ok(());
            }
            for name in found {
                if let Err(index) = state.binlogs.binary_search(&name) {
                    state.binlogs.insert(index, name);
                    added += 1;
                }
            }
        }

        if added > 0 {
            debug!("Found {} new binlog files in {}", added, self.directory.display());
            self.next_file.notify_waiters();
        }
        Ok(())
    }

    /// prev 다음 파일. prev 가 None 이면 첫 파일.
    ///
    /// 다음 파일은 시퀀스 번호가 정확히 1 큰 파일이다. 중간 번호가 아직 없으면 None.
    pub fn get_next_file(&self, prev: Option<&str>) -> Option<String> {
        let state = self.state.lock();
        next_of(&state.binlogs, prev)
    }

    /// file 바로 앞 파일. file 이 None 이면 마지막 파일.
    pub fn get_before(&self, file: Option<&str>) -> Option<String> {
        let state = self.state.lock();
        match file {
            None => state.binlogs.last().cloned(),
            Some(file) => {
                let index = state.binlogs.iter().position(|name| name == file)?;
                index.checked_sub(1).map(|i| state.binlogs[i].clone())
            }
        }
    }

    /// 다음 파일이 생길 때까지 기다린다. 큐가 destroy 되면 None.
    pub async fn wait_for_next_file(&self, prev: Option<&str>) -> Option<String> {
        loop {
            let notified = self.next_file.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let gap = {
                let state = self.state.lock();
                if state.destroyed {
                    return None;
                }
                if let Some(next) = next_of(&state.binlogs, prev) {
                    return Some(next);
                }
                gap_after(&state.binlogs, prev)
            };

            match (gap, prev) {
                (Some(later), Some(prev)) => {
                    warn!(
                        "Successor of {} is missing in {} while {} exists; still waiting",
                        prev,
                        self.directory.display(),
                        later
                    );
                    let _ = tokio::time::timeout(GAP_WARN_INTERVAL, notified).await;
                }
                _ => notified.await,
            }
        }
    }

    pub fn current_binlogs(&self) -> Vec<String> {
        self.state.lock().binlogs.clone()
    }

    /// 재스캔을 멈추고 목록을 비운 뒤 모든 대기자를 깨운다
    pub fn destroy(&self) {
        if let Some(task) = self.reload_task.lock().take() {
            task.abort();
        }
        {
            let mut state = self.state.lock();
            state.binlogs.clear();
            state.destroyed = true;
        }
        self.next_file.notify_waiters();
        info!("Binlog file queue on {} destroyed", self.directory.display());
    }
}

impl Drop for BinlogFileQueue {
    fn drop(&mut self) {
        if let Some(task) = self.reload_task.get_mut().take() {
            task.abort();
        }
    }
}

fn next_of(binlogs: &[String], prev: Option<&str>) -> Option<String> {
    let Some(prev) = prev else {
        return binlogs.first().cloned();
    };

    let mut later = binlogs.iter().filter(|name| name.as_str() > prev);
    match file_sequence(prev) {
        Some(sequence) => later
            .find(|name| file_sequence(name) == Some(sequence + 1))
            .cloned(),
        None => later.next().cloned(),
    }
}

/// prev 의 다음 번호가 없는데 더 뒤의 파일이 있으면 그 첫 파일
fn gap_after(binlogs: &[String], prev: Option<&str>) -> Option<String> {
    let prev = prev?;
    file_sequence(prev)?;
    if next_of(binlogs, Some(prev)).is_some() {
        return None;
    }
    binlogs.iter().find(|name| name.as_str() > prev).cloned()
}
