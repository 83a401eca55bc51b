/// 로컬 binlog 디렉토리 수집 예제
///
/// BINLOG_DIR 의 binlog 파일을 순서대로 읽어 스토어에 넣고,
/// 소비자 루프가 get / ack 하면서 이벤트를 로그로 남깁니다.
use binlog_pipeline::config::PipelineConfig;
use binlog_pipeline::events::EventPayload;
use binlog_pipeline::file_queue::BinlogFileQueue;
use binlog_pipeline::parser::LocalBinlogParser;
use binlog_pipeline::position_manager::{LogPositionManager, MixedLogPositionManager, RemoteLogPositionManager};
use binlog_pipeline::registry::{RunningRegistry, ServerRunningData};
use binlog_pipeline::sink::EntryEventSink;
use binlog_pipeline::store::{MemoryEventStore, DEFAULT_CONSUMER};
use binlog_pipeline::{CdcError, LogEvent};
use std::sync::Arc;
use tracing::{debug, error, info};

fn describe(event: &LogEvent) -> String {
    match &event.payload {
        EventPayload::Rotate(rotate) => format!("rotate -> {}:{}", rotate.file_name, rotate.position),
        EventPayload::TableMap(table) => format!(
            "table map {} = {}.{} ({} columns)",
            table.table_id,
            table.database,
            table.table,
            table.column_count()
        ),
        EventPayload::Rows(rows) => format!("{:?} rows on table {}", rows.kind, rows.table_id),
        EventPayload::Query(query) => format!("query [{}] {}", query.database, query.query),
        EventPayload::Xid(xid) => format!("commit xid={}", xid.xid),
        EventPayload::Gtid(gtid) => format!("gtid {}", gtid.gtid()),
        _ => format!("event type {}", event.type_code()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = PipelineConfig::from_env();
    let destination = config.parser.destination.clone();
    info!(
        "Reading binlogs from {} for {}",
        config.file_queue.directory.display(),
        destination
    );

    let registry = RunningRegistry::new();
    let monitor = registry.monitor(&destination);
    let address = format!("pid-{}", std::process::id());
    if !monitor.try_start(ServerRunningData::new(address.clone())) {
        return Err(format!("{} is already running elsewhere", destination).into());
    }

    let queue = BinlogFileQueue::open(&config.file_queue).await?;
    let store = Arc::new(MemoryEventStore::new(&config.store));
    let remote = Arc::new(RemoteLogPositionManager::with_directory(&config.position_root));
    let positions = Arc::new(MixedLogPositionManager::new(remote));

    let parser = Arc::new(LocalBinlogParser::new(
        config.parser.clone(),
        config.fetcher.clone(),
        queue.clone(),
        Arc::new(EntryEventSink::new(store.clone())),
        positions.clone(),
    ));
    let parser_task = {
        let parser = parser.clone();
        tokio::spawn(async move { parser.run().await })
    };

    // 소비자 루프
    let consumer = {
        let store = store.clone();
        let batch_size = config.store.batch_size;
        let timeout = config.store.get_timeout;
        tokio::spawn(async move {
            loop {
                let events = match store.get(DEFAULT_CONSUMER, batch_size, timeout).await {
                    Ok(events) => events,
                    Err(CdcError::Interrupted) => continue,
                    Err(e) => {
                        error!("Consumer failed: {}", e);
                        break;
                    }
                };
                let Some(last) = events.last() else {
                    continue;
                };
                for event in &events {
                    info!("{} @ {}", describe(event), event.position);
                }
                if let Err(e) = store.ack(DEFAULT_CONSUMER, &last.position) {
                    error!("Ack failed: {}", e);
                    break;
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    parser.stop();
    match parser_task.await? {
        Ok(()) => debug!("Parser finished"),
        Err(e) => error!("Parser failed: {}", e),
    }
    consumer.abort();
    queue.destroy();

    positions.flush().await?;
    positions.shutdown().await?;
    if let Some(position) = positions.get_latest_position(&destination).await? {
        info!("Last persisted position for {}: {}", destination, position);
    }

    monitor.release(&address);
    registry.shutdown();
    Ok(())
}
