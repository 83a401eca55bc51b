//! 이벤트 parser
//!
//! fetch → decode → sink 를 반복하고, sink 가 받아들인 트랜잭션 경계 위치를
//! position manager 에 저장한다.
//!
//! - `MysqlEventParser`: 네트워크 덤프 스트림. 일시적 오류는 지수 백오프 후 재연결,
//!   HA 전환 시 마지막 저장 위치에서 다시 시작한다.
//! - `LocalBinlogParser`: 로컬 binlog 디렉토리를 파일 순서대로 읽는다.
//! - `GroupEventParser`: 여러 parser 를 하나의 group sink 로 묶어 함께 시작하고 멈춘다.

use crate::config::{FetcherConfig, ParserConfig};
use crate::connection::{MySqlConnection, SourceEndpoint};
use crate::context::LogContext;
use crate::decoder::LogDecoder;
use crate::error::{CdcError, Result};
use crate::events::LogEvent;
use crate::fetcher::{FileLogFetcher, LogFetcher};
use crate::file_queue::BinlogFileQueue;
use crate::ha::{HaEndpoints, HaSwitchable};
use crate::position::{LogPosition, BIN_LOG_HEADER_SIZE};
use crate::position_manager::LogPositionManager;
use crate::sink::EventSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 트랜잭션 경계가 없어도 이 개수가 쌓이면 sink 로 넘긴다
const MAX_PENDING_EVENTS: usize = 1024;

/// 파일 끝에서 다음 데이터를 다시 확인하는 간격
const FILE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// parser 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    /// 시작 위치 결정 및 연결 중
    Starting,
    /// 스트리밍 처리 중
    Streaming,
    /// HA 전환 중
    Switching,
    /// 중단됨
    Stopped,
}

/// 실행 단위 parser
#[async_trait]
pub trait EventParser: Send + Sync {
    fn destination(&self) -> &str;

    /// stop 될 때까지 실행
    async fn run(&self) -> Result<()>;

    fn stop(&self);
}

/// 덤프 스트림 연결을 만들어 주는 외부 협력자
///
/// 인증과 핸드셰이크는 구현체의 몫이다. 핸드셰이크가 끝난 스트림을
/// `fetcher::request_dump` 에 넘기면 된다.
#[async_trait]
pub trait BinlogConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &SourceEndpoint,
        position: &LogPosition,
        slave_id: u32,
    ) -> Result<Box<dyn LogFetcher>>;

    /// 저장된 위치가 없을 때 사용할 현재 master 위치
    async fn master_position(&self, endpoint: &SourceEndpoint) -> Result<LogPosition> {
        let mut conn = MySqlConnection::connect(endpoint).await?;
        let position = conn.master_position().await;
        if let Err(e) = conn.close().await {
            debug!("Failed to close control connection to {}: {}", endpoint, e);
        }
        position
    }
}

/// 디코딩된 이벤트를 모아서 sink 로 넘기고 위치를 저장한다
struct EventDispatcher<'a> {
    destination: &'a str,
    sink: &'a dyn EventSink,
    position_manager: &'a dyn LogPositionManager,
    pending: Vec<LogEvent>,
}

impl<'a> EventDispatcher<'a> {
    fn new(
        destination: &'a str,
        sink: &'a dyn EventSink,
        position_manager: &'a dyn LogPositionManager,
    ) -> Self {
        EventDispatcher {
            destination,
            sink,
            position_manager,
            pending: Vec::new(),
        }
    }

    async fn push(&mut self, event: LogEvent) -> Result<()> {
        let boundary = event.is_transaction_end();
        self.pending.push(event);
        if boundary || self.pending.len() >= MAX_PENDING_EVENTS {
            self.flush().await?;
        }
        Ok(())
    }

    /// 쌓인 이벤트를 sink 에 넘긴다. 마지막 트랜잭션 경계 위치를 저장한다.
    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let events = mem::take(&mut self.pending);
        let commit = events
            .iter()
            .rev()
            .find(|event| event.is_transaction_end() && !event.position.is_sentinel())
            .map(|event| event.position.clone());

        self.sink.sink(events, self.destination).await?;
        if let Some(position) = commit {
            self.position_manager
                .persist_log_position(self.destination, &position)
                .await?;
            debug!("Persisted {} for {}", position, self.destination);
        }
        Ok(())
    }
}

fn backoff_delay(config: &ParserConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    config
        .retry_backoff_base
        .saturating_mul(factor)
        .min(config.retry_backoff_max)
}

/// 네트워크 덤프 parser
pub struct MysqlEventParser {
    config: ParserConfig,
    endpoints: Mutex<HaEndpoints>,
    connector: Arc<dyn BinlogConnector>,
    sink: Arc<dyn EventSink>,
    position_manager: Arc<dyn LogPositionManager>,
    decoder: LogDecoder,
    state: Mutex<ProcessingState>,
    running: AtomicBool,
    switch_generation: AtomicU64,
    restart: Notify,
}

impl MysqlEventParser {
    pub fn new(
        config: ParserConfig,
        endpoints: HaEndpoints,
        connector: Arc<dyn BinlogConnector>,
        sink: Arc<dyn EventSink>,
        position_manager: Arc<dyn LogPositionManager>,
    ) -> Self {
        MysqlEventParser {
            config,
            endpoints: Mutex::new(endpoints),
            connector,
            sink,
            position_manager,
            decoder: LogDecoder::new(),
            state: Mutex::new(ProcessingState::Stopped),
            running: AtomicBool::new(true),
            switch_generation: AtomicU64::new(0),
            restart: Notify::new(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.config.destination
    }

    pub fn state(&self) -> ProcessingState {
        *self.state.lock()
    }

    pub fn current_endpoint(&self) -> SourceEndpoint {
        self.endpoints.lock().current().clone()
    }

    /// 재시작 위치: 저장된 위치 → 설정된 시작 위치 → 현재 master 위치
    async fn find_start_position(&self, endpoint: &SourceEndpoint) -> Result<LogPosition> {
        if let Some(position) = self
            .position_manager
            .get_latest_position(&self.config.destination)
            .await?
        {
            debug!("Resuming {} from persisted {}", self.config.destination, position);
            return Ok(position);
        }
        if let Some(position) = &self.config.start_position {
            return Ok(position.clone());
        }
        self.connector.master_position(endpoint).await
    }

    /// stop 또는 전환이 일어날 때까지 대기
    async fn wait_restart(&self, generation: u64) {
        loop {
            let notified = self.restart.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.running.load(Ordering::SeqCst)
                || self.switch_generation.load(Ordering::SeqCst) != generation
            {
                return;
            }
            notified.await;
        }
    }

    async fn dump(
        &self,
        fetcher: &mut dyn LogFetcher,
        context: &mut LogContext,
        progressed: &mut bool,
    ) -> Result<()> {
        let mut dispatcher = EventDispatcher::new(
            &self.config.destination,
            self.sink.as_ref(),
            self.position_manager.as_ref(),
        );

        while fetcher.fetch().await? {
            let event = self.decoder.decode(fetcher.buffer_mut(), context)?;
            *progressed = true;
            dispatcher.push(event).await?;
        }

        // 서버가 스트림을 끝냈다. 미완료 트랜잭션은 버리고 재연결한다.
        Err(CdcError::ConnectionError(
            "Binlog stream ended by server".to_string(),
        ))
    }

    async fn run_once(&self, generation: u64, progressed: &mut bool) -> Result<()> {
        let endpoint = self.current_endpoint();
        let start = self.find_start_position(&endpoint).await?;
        info!(
            "Starting dump of {} from {} at {}",
            self.config.destination, endpoint, start
        );

        let mut fetcher = self
            .connector
            .connect(&endpoint, &start, self.config.slave_id)
            .await?;
        let mut context = LogContext::new();
        context.set_position(start);
        *self.state.lock() = ProcessingState::Streaming;

        let result = tokio::select! {
            result = self.dump(fetcher.as_mut(), &mut context, progressed) => result,
            _ = self.wait_restart(generation) => Err(CdcError::Interrupted),
        };

        if let Err(e) = fetcher.close().await {
            debug!("Failed to close binlog stream: {}", e);
        }
        result
    }

    /// stop 될 때까지 실행. 프로토콜 손상 같은 치명적 오류는 그대로 돌려준다.
    pub async fn run(&self) -> Result<()> {
        let mut attempt = 0u32;

        while self.running.load(Ordering::SeqCst) {
            *self.state.lock() = ProcessingState::Starting;
            let generation = self.switch_generation.load(Ordering::SeqCst);
            let mut progressed = false;
            let result = self.run_once(generation, &mut progressed).await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if progressed {
                attempt = 0;
            }

            let error = match result {
                Ok(()) => continue,
                Err(e) => e,
            };
            if matches!(error, CdcError::Interrupted) {
                info!("Restarting {} after interruption", self.config.destination);
                attempt = 0;
                continue;
            }
            if !error.is_transient() {
                error!("Parser for {} failed: {}", self.config.destination, error);
                *self.state.lock() = ProcessingState::Stopped;
                return Err(error);
            }

            attempt += 1;
            if self.config.max_retries > 0 && attempt > self.config.max_retries {
                error!(
                    "Giving up on {} after {} retries: {}",
                    self.config.destination, self.config.max_retries, error
                );
                *self.state.lock() = ProcessingState::Stopped;
                return Err(error);
            }

            let delay = backoff_delay(&self.config, attempt);
            warn!(
                "Dump of {} failed ({}), retrying in {:?}",
                self.config.destination, error, delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wait_restart(generation) => {}
            }
        }

        *self.state.lock() = ProcessingState::Stopped;
        info!("Parser for {} stopped", self.config.destination);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sink.interrupt();
        self.restart.notify_waiters();
    }

    fn begin_switch(&self, endpoint: SourceEndpoint) {
        info!("Switching {} to {}", self.config.destination, endpoint);
        *self.state.lock() = ProcessingState::Switching;
        self.switch_generation.fetch_add(1, Ordering::SeqCst);
        self.sink.interrupt();
        self.restart.notify_waiters();
    }
}

#[async_trait]
impl HaSwitchable for MysqlEventParser {
    async fn switchover(&self) -> Result<()> {
        let next = self.endpoints.lock().switch().clone();
        self.begin_switch(next);
        Ok(())
    }

    async fn switchover_to(&self, endpoint: SourceEndpoint) -> Result<()> {
        let next = self.endpoints.lock().switch_to(endpoint).clone();
        self.begin_switch(next);
        Ok(())
    }
}

/// 로컬 binlog 디렉토리 parser
pub struct LocalBinlogParser {
    config: ParserConfig,
    fetcher_config: FetcherConfig,
    queue: Arc<BinlogFileQueue>,
    sink: Arc<dyn EventSink>,
    position_manager: Arc<dyn LogPositionManager>,
    decoder: LogDecoder,
    running: AtomicBool,
    stopped: Notify,
}

impl LocalBinlogParser {
    pub fn new(
        config: ParserConfig,
        fetcher_config: FetcherConfig,
        queue: Arc<BinlogFileQueue>,
        sink: Arc<dyn EventSink>,
        position_manager: Arc<dyn LogPositionManager>,
    ) -> Self {
        LocalBinlogParser {
            config,
            fetcher_config,
            queue,
            sink,
            position_manager,
            decoder: LogDecoder::new(),
            running: AtomicBool::new(true),
            stopped: Notify::new(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.config.destination
    }

    async fn wait_stopped(&self) {
        loop {
            let notified = self.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    async fn find_start_position(&self) -> Result<Option<LogPosition>> {
        if let Some(position) = self
            .position_manager
            .get_latest_position(&self.config.destination)
            .await?
        {
            return Ok(Some(position));
        }
        if let Some(position) = &self.config.start_position {
            return Ok(Some(position.clone()));
        }

        let first = tokio::select! {
            first = self.queue.wait_for_next_file(None) => first,
            _ = self.wait_stopped() => None,
        };
        Ok(first.map(LogPosition::start_of))
    }

    /// 파일 중간에서 시작하면 먼저 파일 첫 이벤트(FDE)로 포맷을 맞춘다
    async fn prime_format_description(&self, file_name: &str, context: &mut LogContext) -> Result<()> {
        let mut fetcher =
            FileLogFetcher::open(self.queue.path_of(file_name), BIN_LOG_HEADER_SIZE, &self.fetcher_config)
                .await?;
        if fetcher.fetch().await? {
            self.decoder.decode(fetcher.buffer_mut(), context)?;
        }
        fetcher.close().await
    }

    /// stop 되거나 파일 큐가 destroy 될 때까지 실행
    pub async fn run(&self) -> Result<()> {
        let Some(start) = self.find_start_position().await? else {
            return Ok(());
        };
        info!("Reading local binlogs for {} from {}", self.config.destination, start);

        let mut dispatcher = EventDispatcher::new(
            &self.config.destination,
            self.sink.as_ref(),
            self.position_manager.as_ref(),
        );
        let mut file_name = start.file_name.clone();
        let mut offset = start.position;

        while self.running.load(Ordering::SeqCst) {
            let mut context = LogContext::new();
            context.set_position(LogPosition::new(file_name.clone(), offset));
            if offset > BIN_LOG_HEADER_SIZE {
                self.prime_format_description(&file_name, &mut context).await?;
                context.set_position(LogPosition::new(file_name.clone(), offset));
            }

            let mut fetcher =
                FileLogFetcher::open(self.queue.path_of(&file_name), offset, &self.fetcher_config).await?;
            let next = self.read_file(&mut fetcher, &mut context, &mut dispatcher, &file_name).await;
            fetcher.close().await?;

            match next? {
                Some(next) => {
                    info!("Moving from {} to {}", file_name, next);
                    file_name = next;
                    offset = BIN_LOG_HEADER_SIZE;
                }
                None => break,
            }
        }

        dispatcher.flush().await?;
        info!("Local parser for {} stopped", self.config.destination);
        Ok(())
    }

    /// 파일 끝까지 읽고 다음 파일 이름을 돌려준다. stop 되면 None.
    async fn read_file(
        &self,
        fetcher: &mut FileLogFetcher,
        context: &mut LogContext,
        dispatcher: &mut EventDispatcher<'_>,
        file_name: &str,
    ) -> Result<Option<String>> {
        loop {
            if fetcher.fetch().await? {
                let event = self.decoder.decode(fetcher.buffer_mut(), context)?;
                dispatcher.push(event).await?;
                continue;
            }

            if let Some(next) = self.queue.get_next_file(Some(file_name)) {
                // 다음 파일이 생겼으면 현재 파일은 더 늘어나지 않는다. 한 번 더 확인한다.
                if fetcher.fetch().await? {
                    let event = self.decoder.decode(fetcher.buffer_mut(), context)?;
                    dispatcher.push(event).await?;
                    continue;
                }
                return Ok(Some(next));
            }

            tokio::select! {
                next = self.queue.wait_for_next_file(Some(file_name)) => {
                    if next.is_none() {
                        return Ok(None);
                    }
                }
                _ = tokio::time::sleep(FILE_POLL_INTERVAL) => {}
                _ = self.wait_stopped() => return Ok(None),
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sink.interrupt();
        self.stopped.notify_waiters();
    }
}

#[async_trait]
impl EventParser for MysqlEventParser {
    fn destination(&self) -> &str {
        MysqlEventParser::destination(self)
    }

    async fn run(&self) -> Result<()> {
        MysqlEventParser::run(self).await
    }

    fn stop(&self) {
        MysqlEventParser::stop(self)
    }
}

#[async_trait]
impl EventParser for LocalBinlogParser {
    fn destination(&self) -> &str {
        LocalBinlogParser::destination(self)
    }

    async fn run(&self) -> Result<()> {
        LocalBinlogParser::run(self).await
    }

    fn stop(&self) {
        LocalBinlogParser::stop(self)
    }
}

/// 여러 parser 를 하나의 group sink 에 묶는다
///
/// 구성원 parser 들은 같은 `GroupEventSink` 를 sink 로 받아야 하고,
/// barrier 의 group size 는 구성원 수와 같아야 한다.
pub struct GroupEventParser {
    parsers: Vec<Arc<dyn EventParser>>,
    sink: Arc<dyn EventSink>,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl GroupEventParser {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        GroupEventParser {
            parsers: Vec::new(),
            sink,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_parser(&mut self, parser: Arc<dyn EventParser>) {
        self.parsers.push(parser);
    }

    pub fn parsers(&self) -> &[Arc<dyn EventParser>] {
        &self.parsers
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// 구성원 parser 를 각각 task 로 실행. 이미 실행 중이면 무시한다.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for parser in &self.parsers {
            let parser = parser.clone();
            info!("Starting group member {}", parser.destination());
            tasks.push(tokio::spawn(async move { parser.run().await }));
        }
    }

    /// 구성원을 모두 멈추고 끝날 때까지 기다린다. 첫 번째 실패를 돌려준다.
    pub async fn stop(&self) -> Result<()> {
        for parser in &self.parsers {
            parser.stop();
        }
        self.sink.interrupt();

        let tasks = mem::take(&mut *self.tasks.lock());
        let mut first_error = None;
        for (parser, task) in self.parsers.iter().zip(tasks) {
            let result = task
                .await
                .map_err(|e| CdcError::Other(format!("Parser task panicked: {}", e)))
                .and_then(|result| result);
            match result {
                // barrier 에서 기다리던 구성원은 인터럽트로 끝난다
                Ok(()) | Err(CdcError::Interrupted) => {}
                Err(e) => {
                    error!("Group member {} failed: {}", parser.destination(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        info!("Group parser stopped ({} members)", self.parsers.len());
        first_error.map_or(Ok(()), Err)
    }
}
