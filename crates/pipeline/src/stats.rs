//! 핫패스 카운터 및 주기 리포터
//!
//! 카운터는 relaxed 순서의 atomic으로 갱신됩니다. 다른 데이터에 대한
//! 펜스가 필요 없고 집계값의 정확성만 필요하기 때문입니다.
//!
//! [`StatsReporter`]는 백그라운드 스레드에서 주기적으로 스냅샷을 찍어
//! 콘솔 하트비트를 남기고 Prometheus 레코더에 델타를 반영합니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use vigil_core::metrics as metric_names;

/// 파이프라인 전역 카운터
///
/// 오케스트레이터가 생성하여 각 컴포넌트에 `Arc`로 주입합니다.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// 수신된 인바운드 청크 수 (UDP 데이터그램 + TCP read 단위)
    packets_received: AtomicU64,
    /// 드롭된 이벤트 수 (링 포화 + 레이트리밋 거부)
    packets_dropped: AtomicU64,
    /// 파싱 실패 수
    parse_errors: AtomicU64,
    /// 실행된 모델 추론 수
    inferences: AtomicU64,
    /// 치명적 판정 수
    threats: AtomicU64,
    /// DB에 기록된 행 수
    db_rows_written: AtomicU64,
    /// DB 플러시 실패 수
    db_errors: AtomicU64,
    /// pub/sub 발행 실패 수
    publish_errors: AtomicU64,
}

/// 특정 시점의 카운터 값
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub parse_errors: u64,
    pub inferences: u64,
    pub threats: u64,
    pub db_rows_written: u64,
    pub db_errors: u64,
    pub publish_errors: u64,
}

impl PipelineStats {
    /// 0으로 초기화된 카운터 집합을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_packets_received(&self, count: u64) {
        self.packets_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_packets_dropped(&self, count: u64) {
        self.packets_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_parse_errors(&self, count: u64) {
        self.parse_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_inferences(&self, count: u64) {
        self.inferences.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_threats(&self, count: u64) {
        self.threats.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_db_rows_written(&self, count: u64) {
        self.db_rows_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_db_errors(&self, count: u64) {
        self.db_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_publish_errors(&self, count: u64) {
        self.publish_errors.fetch_add(count, Ordering::Relaxed);
    }

    /// 현재 카운터 값의 스냅샷을 반환합니다.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            inferences: self.inferences.load(Ordering::Relaxed),
            threats: self.threats.load(Ordering::Relaxed),
            db_rows_written: self.db_rows_written.load(Ordering::Relaxed),
            db_errors: self.db_errors.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
        }
    }
}

/// 주기 리포터 — 하트비트 로그 및 Prometheus 반영
///
/// 생성 시 워커 스레드를 시작하고, drop 시 플래그를 내리고 조인합니다.
pub struct StatsReporter {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl StatsReporter {
    /// 리포터를 시작합니다.
    pub fn start(stats: Arc<PipelineStats>, interval: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_worker = Arc::clone(&running);

        let worker = std::thread::Builder::new()
            .name("vigil-stats".to_owned())
            .spawn(move || {
                reporter_worker(&stats, interval, &running_worker);
            })
            .expect("failed to spawn stats reporter thread");

        Self {
            running,
            worker: Some(worker),
        }
    }

    /// 리포터를 정지하고 워커를 조인합니다.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reporter_worker(stats: &PipelineStats, interval: Duration, running: &AtomicBool) {
    let mut last = StatsSnapshot::default();

    while running.load(Ordering::Relaxed) {
        std::thread::park_timeout(interval);
        if !running.load(Ordering::Relaxed) {
            break;
        }

        let snap = stats.snapshot();
        let delta_rx = snap.packets_received - last.packets_received;
        #[allow(clippy::cast_precision_loss)]
        let eps = delta_rx as f64 / interval.as_secs_f64();

        tracing::info!(
            eps = format_args!("{eps:.1}"),
            total_rx = snap.packets_received,
            drops = snap.packets_dropped,
            threats = snap.threats,
            db = snap.db_rows_written,
            "stats heartbeat"
        );

        // Prometheus 레코더에는 델타만 반영 (counter는 누적 의미)
        record_delta(metric_names::PACKETS_RECEIVED_TOTAL, delta_rx);
        record_delta(
            metric_names::PACKETS_DROPPED_TOTAL,
            snap.packets_dropped - last.packets_dropped,
        );
        record_delta(
            metric_names::PARSE_ERRORS_TOTAL,
            snap.parse_errors - last.parse_errors,
        );
        record_delta(
            metric_names::INFERENCES_TOTAL,
            snap.inferences - last.inferences,
        );
        record_delta(
            metric_names::THREATS_DETECTED_TOTAL,
            snap.threats - last.threats,
        );
        record_delta(
            metric_names::DB_ROWS_WRITTEN_TOTAL,
            snap.db_rows_written - last.db_rows_written,
        );
        record_delta(metric_names::DB_ERRORS_TOTAL, snap.db_errors - last.db_errors);
        record_delta(
            metric_names::PUBLISH_ERRORS_TOTAL,
            snap.publish_errors - last.publish_errors,
        );
        metrics::gauge!(metric_names::EVENTS_PER_SECOND).set(eps);

        last = snap;
    }
}

fn record_delta(name: &'static str, delta: u64) {
    if delta > 0 {
        metrics::counter!(name).increment(delta);
    }
}
