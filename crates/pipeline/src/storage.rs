//! 배치 스토리지 — 누적 및 ClickHouse 플러시
//!
//! 판정이 끝난 레코드를 인메모리 배치로 누적하고, 배치 크기 또는 최고령
//! 레코드 기준 시간 간격 중 먼저 도달하는 조건에서 단일 배치 INSERT로
//! 플러시합니다. 플러시 실패 시 배치를 버리고 에러 카운터만 증가시킵니다
//! (head-of-line 블로킹보다 유실을 선호).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};

use vigil_core::error::StorageError;
use vigil_core::types::ParsedLog;

use crate::stats::PipelineStats;

/// 플러시 HTTP 요청 타임아웃
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// 플러시 워커가 시간 조건을 검사하는 주기
const FLUSH_POLL_TICK: Duration = Duration::from_millis(100);

/// 분석 스토어에 기록되는 한 행
#[derive(Debug, Clone)]
pub struct DbRow {
    /// 행 UUID
    pub id: String,
    /// 수신 시각 (UNIX epoch 기준 나노초)
    pub timestamp_ns: u64,
    /// 소스 호스트
    pub host: String,
    /// 국가 ISO 코드
    pub country: String,
    /// 서비스명
    pub service: String,
    /// 메시지 본문
    pub message: String,
    /// 최종 이상 점수
    pub anomaly_score: f32,
    /// 치명적 판정 여부
    pub is_threat: bool,
}

impl DbRow {
    /// 판정이 끝난 로그에서 행을 생성합니다.
    pub fn from_log(log: &ParsedLog, anomaly_score: f32, is_threat: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp_ns: log.timestamp_ns,
            host: log.host.clone(),
            country: log.country.clone(),
            service: log.service.clone(),
            message: log.message.clone(),
            anomaly_score,
            is_threat,
        }
    }
}

/// 배치 INSERT 싱크 경계
pub trait LogStore: Send + Sync {
    /// 행 배치를 삽입합니다.
    fn insert_rows(&self, rows: &[DbRow]) -> Result<(), StorageError>;
}

/// SQL 문자열 리터럴 이스케이프 (작은따옴표 중복, 백슬래시 이스케이프)
fn escape_sql(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out
}

/// 나노초 타임스탬프를 `YYYY-MM-DD HH:MM:SS` (UTC)로 포맷합니다.
fn format_timestamp(timestamp_ns: u64) -> String {
    let secs = i64::try_from(timestamp_ns / 1_000_000_000).unwrap_or(0);
    match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => "1970-01-01 00:00:00".to_owned(),
    }
}

/// 배치 INSERT 쿼리를 생성합니다.
///
/// 문자열 필드는 인용/이스케이프되고, 숫자는 비인용, 불리언은 0/1로
/// 직렬화됩니다.
pub fn build_insert_sql(table: &str, rows: &[DbRow]) -> String {
    let mut sql = format!(
        "INSERT INTO {table} (id, timestamp, host, country, service, message, anomaly_score, is_threat) VALUES "
    );

    for (index, row) in rows.iter().enumerate() {
        if index > 0 {
            sql.push(',');
        }
        sql.push_str(&format!(
            "('{}', '{}', '{}', '{}', '{}', '{}', {}, {})",
            row.id,
            format_timestamp(row.timestamp_ns),
            escape_sql(&row.host),
            escape_sql(&row.country),
            escape_sql(&row.service),
            escape_sql(&row.message),
            row.anomaly_score,
            u8::from(row.is_threat),
        ));
    }
    sql
}

/// ClickHouse HTTP 클라이언트
///
/// 배치를 단일 `INSERT ... VALUES` 쿼리로 만들어 HTTP POST합니다.
/// 200 응답만 성공으로 취급합니다.
pub struct ClickHouseClient {
    url: String,
    table: String,
    client: reqwest::blocking::Client,
}

impl ClickHouseClient {
    /// 새 클라이언트를 생성합니다.
    pub fn new(url: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: table.into(),
            client: reqwest::blocking::Client::builder()
                .timeout(FLUSH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl LogStore for ClickHouseClient {
    fn insert_rows(&self, rows: &[DbRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        let sql = build_insert_sql(&self.table, rows);
        let response = self
            .client
            .post(&self.url)
            .body(sql)
            .send()
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.text().unwrap_or_default();
            return Err(StorageError::Write(format!(
                "http {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(())
    }
}

struct Pending {
    rows: Vec<DbRow>,
    /// 현재 배치에서 가장 오래된 행의 도착 시각
    oldest: Option<Instant>,
}

struct BatcherInner {
    pending: Mutex<Pending>,
    store: Box<dyn LogStore>,
    flush_batch_size: usize,
    flush_interval: Duration,
    stats: Arc<PipelineStats>,
    running: AtomicBool,
}

impl BatcherInner {
    fn flush(&self, rows: Vec<DbRow>) {
        if rows.is_empty() {
            return;
        }
        let count = rows.len() as u64;
        match self.store.insert_rows(&rows) {
            Ok(()) => {
                self.stats.inc_db_rows_written(count);
                tracing::debug!(rows = count, "batch flushed");
            }
            Err(e) => {
                // 재시도 없음: 배치를 버리고 카운터만 증가
                self.stats.inc_db_errors(1);
                tracing::error!(rows = count, error = %e, "batch flush failed, dropping batch");
            }
        }
    }

    /// 시간 조건이 충족된 경우 배치를 꺼냅니다.
    fn take_if_due(&self, now: Instant) -> Vec<DbRow> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.oldest {
            Some(oldest) if now.saturating_duration_since(oldest) >= self.flush_interval => {
                pending.oldest = None;
                std::mem::take(&mut pending.rows)
            }
            _ => Vec::new(),
        }
    }

    fn take_all(&self) -> Vec<DbRow> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.oldest = None;
        std::mem::take(&mut pending.rows)
    }
}

/// 스토리지 배처
///
/// 생성 시 주기 플러시 워커를 시작합니다. `shutdown()`(또는 drop)은 워커를
/// 정지한 뒤 잔여 배치를 플러시합니다.
pub struct StorageBatcher {
    inner: Arc<BatcherInner>,
    worker: Option<JoinHandle<()>>,
}

impl StorageBatcher {
    /// 새 배처를 생성하고 플러시 워커를 시작합니다.
    pub fn new(
        store: Box<dyn LogStore>,
        flush_batch_size: usize,
        flush_interval: Duration,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let inner = Arc::new(BatcherInner {
            pending: Mutex::new(Pending {
                rows: Vec::with_capacity(flush_batch_size),
                oldest: None,
            }),
            store,
            flush_batch_size,
            flush_interval,
            stats,
            running: AtomicBool::new(true),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("vigil-storage".to_owned())
            .spawn(move || flush_worker(&worker_inner))
            .expect("failed to spawn storage flush worker");

        Self {
            inner,
            worker: Some(worker),
        }
    }

    /// 판정이 끝난 로그를 배치에 추가합니다.
    ///
    /// 배치 크기 조건에 도달하면 이 호출에서 즉시 플러시합니다.
    pub fn enqueue(&self, log: &ParsedLog, anomaly_score: f32, is_threat: bool) {
        let row = DbRow::from_log(log, anomaly_score, is_threat);

        let due = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if pending.rows.is_empty() {
                pending.oldest = Some(Instant::now());
            }
            pending.rows.push(row);
            if pending.rows.len() >= self.inner.flush_batch_size {
                pending.oldest = None;
                std::mem::take(&mut pending.rows)
            } else {
                Vec::new()
            }
        };

        // 크기 트리거 플러시는 락 밖에서 수행
        self.inner.flush(due);
    }

    /// 현재 누적된 행 수를 반환합니다.
    pub fn pending_rows(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .len()
    }

    /// 워커를 정지하고 잔여 배치를 플러시합니다.
    pub fn shutdown(&mut self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
        let remaining = self.inner.take_all();
        self.inner.flush(remaining);
    }
}

impl Drop for StorageBatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_worker(inner: &BatcherInner) {
    while inner.running.load(Ordering::Relaxed) {
        std::thread::park_timeout(FLUSH_POLL_TICK.min(inner.flush_interval));
        if !inner.running.load(Ordering::Relaxed) {
            break;
        }
        let due = inner.take_if_due(Instant::now());
        inner.flush(due);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 삽입 호출을 기록하는 테스트 스토어
    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<DbRow>>>,
        fail: AtomicBool,
    }

    #[derive(Clone, Default)]
    struct SharedStore(Arc<RecordingStore>);

    impl LogStore for SharedStore {
        fn insert_rows(&self, rows: &[DbRow]) -> Result<(), StorageError> {
            if self.0.fail.load(Ordering::Relaxed) {
                return Err(StorageError::Write("injected failure".to_owned()));
            }
            self.0.batches.lock().unwrap().push(rows.to_vec());
            Ok(())
        }
    }

    impl SharedStore {
        fn batch_count(&self) -> usize {
            self.0.batches.lock().unwrap().len()
        }

        fn total_rows(&self) -> usize {
            self.0.batches.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    fn sample_log(message: &str) -> ParsedLog {
        let mut log = ParsedLog::new(
            1_700_000_000_000_000_000,
            "10.0.0.1".to_owned(),
            "sshd".to_owned(),
            message.to_owned(),
        );
        log.country = "KR".to_owned();
        log
    }

    #[test]
    fn escape_sql_doubles_quotes_and_backslashes() {
        assert_eq!(escape_sql("it's"), "it''s");
        assert_eq!(escape_sql(r"a\b"), r"a\\b");
        assert_eq!(escape_sql("plain"), "plain");
    }

    #[test]
    fn format_timestamp_truncates_to_seconds() {
        // 2023-11-14T22:13:20Z
        assert_eq!(
            format_timestamp(1_700_000_000_123_456_789),
            "2023-11-14 22:13:20"
        );
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }

    #[test]
    fn insert_sql_shape() {
        let row = DbRow {
            id: "abc-123".to_owned(),
            timestamp_ns: 1_700_000_000_000_000_000,
            host: "10.0.0.1".to_owned(),
            country: "KR".to_owned(),
            service: "sshd".to_owned(),
            message: "user's login".to_owned(),
            anomaly_score: 0.5,
            is_threat: true,
        };
        let sql = build_insert_sql("vigil.logs", &[row]);
        assert!(sql.starts_with(
            "INSERT INTO vigil.logs (id, timestamp, host, country, service, message, anomaly_score, is_threat) VALUES "
        ));
        assert!(sql.contains("'2023-11-14 22:13:20'"));
        assert!(sql.contains("user''s login"));
        assert!(sql.ends_with("0.5, 1)"));
    }

    #[test]
    fn insert_sql_joins_rows_with_commas() {
        let rows: Vec<DbRow> = (0..3)
            .map(|i| DbRow::from_log(&sample_log(&format!("m{i}")), 0.1, false))
            .collect();
        let sql = build_insert_sql("t", &rows);
        assert_eq!(sql.matches("),(").count(), 2);
    }

    #[test]
    fn size_trigger_flushes_full_batch() {
        let store = SharedStore::default();
        let batcher = StorageBatcher::new(
            Box::new(store.clone()),
            3,
            Duration::from_secs(3600),
            Arc::new(PipelineStats::new()),
        );

        batcher.enqueue(&sample_log("a"), 0.1, false);
        batcher.enqueue(&sample_log("b"), 0.2, false);
        assert_eq!(store.batch_count(), 0);
        assert_eq!(batcher.pending_rows(), 2);

        batcher.enqueue(&sample_log("c"), 0.3, false);
        assert_eq!(store.batch_count(), 1);
        assert_eq!(store.total_rows(), 3);
        assert_eq!(batcher.pending_rows(), 0);
    }

    #[test]
    fn interval_trigger_flushes_partial_batch() {
        let store = SharedStore::default();
        let batcher = StorageBatcher::new(
            Box::new(store.clone()),
            1000,
            Duration::from_millis(50),
            Arc::new(PipelineStats::new()),
        );

        batcher.enqueue(&sample_log("a"), 0.1, false);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(store.batch_count(), 1);
        assert_eq!(store.total_rows(), 1);
    }

    #[test]
    fn shutdown_flushes_remainder() {
        let store = SharedStore::default();
        let stats = Arc::new(PipelineStats::new());
        let mut batcher = StorageBatcher::new(
            Box::new(store.clone()),
            1000,
            Duration::from_secs(3600),
            Arc::clone(&stats),
        );

        batcher.enqueue(&sample_log("a"), 0.1, false);
        batcher.enqueue(&sample_log("b"), 0.2, true);
        batcher.shutdown();

        assert_eq!(store.total_rows(), 2);
        assert_eq!(stats.snapshot().db_rows_written, 2);
    }

    #[test]
    fn failed_flush_drops_batch_and_counts_error() {
        let store = SharedStore::default();
        store.0.fail.store(true, Ordering::Relaxed);
        let stats = Arc::new(PipelineStats::new());
        let batcher = StorageBatcher::new(
            Box::new(store.clone()),
            2,
            Duration::from_secs(3600),
            Arc::clone(&stats),
        );

        batcher.enqueue(&sample_log("a"), 0.1, false);
        batcher.enqueue(&sample_log("b"), 0.2, false);

        assert_eq!(store.batch_count(), 0);
        assert_eq!(batcher.pending_rows(), 0); // 배치는 버려짐
        let snap = stats.snapshot();
        assert_eq!(snap.db_errors, 1);
        assert_eq!(snap.db_rows_written, 0);
    }

    #[test]
    fn rows_carry_unique_ids() {
        let a = DbRow::from_log(&sample_log("a"), 0.1, false);
        let b = DbRow::from_log(&sample_log("a"), 0.1, false);
        assert_ne!(a.id, b.id);
    }
}
