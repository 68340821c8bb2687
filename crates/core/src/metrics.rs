//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 핫패스 카운터는 파이프라인 내부의 relaxed atomic으로 집계되고,
//! 주기 리포터가 이 이름으로 `metrics::counter!()` / `metrics::gauge!()`에
//! 반영합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `vigil_`
//! - 접미어: `_total` (counter), 없음 (gauge)

// ─── 수집 계층 메트릭 ───────────────────────────────────────────────

/// 수신된 인바운드 청크 수 — UDP 데이터그램 + TCP read 단위 (counter)
pub const PACKETS_RECEIVED_TOTAL: &str = "vigil_packets_received_total";

/// 드롭된 이벤트 수 — 링 버퍼 포화 + 레이트리밋 거부 (counter)
pub const PACKETS_DROPPED_TOTAL: &str = "vigil_packets_dropped_total";

// ─── 탐지 계층 메트릭 ───────────────────────────────────────────────

/// 파싱 실패 수 (counter)
pub const PARSE_ERRORS_TOTAL: &str = "vigil_parse_errors_total";

/// 실행된 모델 추론 수 (counter)
pub const INFERENCES_TOTAL: &str = "vigil_inferences_total";

/// 치명적 판정 수 (counter)
pub const THREATS_DETECTED_TOTAL: &str = "vigil_threats_detected_total";

// ─── 스토리지 메트릭 ────────────────────────────────────────────────

/// ClickHouse에 기록된 행 수 (counter)
pub const DB_ROWS_WRITTEN_TOTAL: &str = "vigil_db_rows_written_total";

/// DB 플러시 실패 수 (counter)
pub const DB_ERRORS_TOTAL: &str = "vigil_db_errors_total";

/// pub/sub 발행 실패 수 (counter)
pub const PUBLISH_ERRORS_TOTAL: &str = "vigil_publish_errors_total";

// ─── 게이지 ─────────────────────────────────────────────────────────

/// 초당 수신 이벤트 수 (gauge, 하트비트 간격 기준 델타)
pub const EVENTS_PER_SECOND: &str = "vigil_events_per_second";

/// 데몬 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "vigil_daemon_uptime_seconds";

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출해야 합니다.
/// 일반적으로 `vigil-daemon`의 시작 시점에서 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(
        PACKETS_RECEIVED_TOTAL,
        "Total inbound chunks received (UDP datagrams + TCP reads)"
    );
    describe_counter!(
        PACKETS_DROPPED_TOTAL,
        "Total events dropped (ring buffer full or rate limit deny)"
    );
    describe_counter!(PARSE_ERRORS_TOTAL, "Total log parse failures");
    describe_counter!(INFERENCES_TOTAL, "Total anomaly model inferences run");
    describe_counter!(THREATS_DETECTED_TOTAL, "Total critical verdicts");
    describe_counter!(DB_ROWS_WRITTEN_TOTAL, "Total rows flushed to ClickHouse");
    describe_counter!(DB_ERRORS_TOTAL, "Total ClickHouse flush failures");
    describe_counter!(PUBLISH_ERRORS_TOTAL, "Total pub/sub publish failures");
    describe_gauge!(EVENTS_PER_SECOND, "Inbound event rate over the last interval");
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Daemon uptime in seconds");
}
