//! 파이프라인 오케스트레이션 — 스레드 스폰/피닝과 판정 루프
//!
//! [`Pipeline`]은 링 버퍼, 수신기, 탐지기, 능동 방어, 스토리지를 소유하고
//! 두 개의 데이터 플레인 스레드를 관리합니다:
//!
//! - **수집 스레드** (`BB_Ingest`, 코어 0, FIFO 90): 단일 스레드 tokio
//!   런타임 위에서 UDP/TCP 수신기를 직렬 실행하고 링 버퍼에 생산합니다.
//! - **처리 스레드** (`BB_Brain`, 코어 1, FIFO 80): busy-yield 루프로 링을
//!   마이크로배치 드레인하여 파싱/보강/판정/디스패치를 수행합니다.
//!
//! 코어 피닝과 실시간 우선순위는 best-effort이며 실패해도 치명적이지
//! 않습니다. 종료는 단일 atomic 플래그와 취소 토큰으로 신호되며, 워커는
//! 진행 중인 반복을 마친 뒤 종료합니다.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vigil_core::config::VigilConfig;
use vigil_core::error::{IngestError, VigilError};
use vigil_core::types::{ParsedLog, Verdict};

use crate::alert::AlertManager;
use crate::blocklist::{BlockList, FirewallAdapter, IptablesFirewall};
use crate::collector::{TcpCollector, TcpCollectorConfig, UdpCollector, UdpCollectorConfig};
use crate::enrich::GeoIpService;
use crate::infer::{AnomalyModel, BaselineModel};
use crate::limiter::RateLimiter;
use crate::parser;
use crate::publish::{AlertSink, RedisPublisher};
use crate::ring::{ring_buffer, RawLogEvent, RingConsumer, RingProducer};
use crate::rules::RuleEngine;
use crate::stats::{PipelineStats, StatsReporter};
use crate::storage::{ClickHouseClient, LogStore, StorageBatcher};
use crate::thread::{pin_current_thread_to_core, set_realtime_priority};

/// 수집 스레드 이름 (Linux 한도인 15바이트 이내)
const INGEST_THREAD_NAME: &str = "BB_Ingest";
/// 처리 스레드 이름
const PROCESSING_THREAD_NAME: &str = "BB_Brain";

/// 레이트리미터 유휴 엔트리 퇴거 배수 (쿨다운 윈도우 기준)
const LIMITER_EVICTION_FACTOR: u64 = 10;

/// 파이프라인 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 파이프라인 빌더
///
/// 외부 경계(방화벽, 모델, 발행기, 스토어)는 기본 구현이 제공되지만
/// 테스트에서 주입으로 교체할 수 있습니다.
pub struct PipelineBuilder {
    config: VigilConfig,
    model: Option<Box<dyn AnomalyModel>>,
    firewall: Option<Box<dyn FirewallAdapter>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    store: Option<Box<dyn LogStore>>,
}

impl PipelineBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new(config: VigilConfig) -> Self {
        Self {
            config,
            model: None,
            firewall: None,
            alert_sink: None,
            store: None,
        }
    }

    /// 이상 탐지 모델을 주입합니다.
    pub fn model(mut self, model: Box<dyn AnomalyModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// 방화벽 어댑터를 주입합니다.
    pub fn firewall(mut self, firewall: Box<dyn FirewallAdapter>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    /// 알림 발행 싱크를 주입합니다.
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// 스토리지 싱크를 주입합니다.
    pub fn store(mut self, store: Box<dyn LogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 파이프라인을 조립합니다.
    ///
    /// 규칙 파일 로드 실패는 치명적 오류입니다 (파일이 없는 경우는 규칙
    /// 없이 시작). 수신 소켓 바인드는 `start()`에서 수행됩니다.
    pub fn build(self) -> Result<Pipeline, VigilError> {
        let config = self.config;
        config.validate()?;

        let stats = Arc::new(PipelineStats::new());

        let limiter = Arc::new(RateLimiter::new(
            config.ingest.rate_limit_per_sec,
            config.ingest.rate_limit_burst,
            Duration::from_secs(config.defense.cooldown_seconds * LIMITER_EVICTION_FACTOR),
        ));

        let rules = if std::path::Path::new(&config.detection.rules_path).exists() {
            RuleEngine::load_from_file(&config.detection.rules_path)?
        } else {
            tracing::info!(
                path = %config.detection.rules_path,
                "rules file not found, starting with signature matching disabled"
            );
            RuleEngine::new()
        };

        let geoip = GeoIpService::load(&config.detection.geoip_path);

        let model = self.model.unwrap_or_else(|| Box::new(BaselineModel::new()));

        let firewall = self
            .firewall
            .unwrap_or_else(|| Box::new(IptablesFirewall::new()));
        let blocklist = Arc::new(BlockList::new(firewall));

        let alert_sink = self.alert_sink.unwrap_or_else(|| {
            Arc::new(RedisPublisher::new(
                config.storage.redis_addr.clone(),
                config.storage.alert_channel.clone(),
            ))
        });

        let alerts = Arc::new(AlertManager::new(
            Duration::from_secs(config.defense.cooldown_seconds),
            config.defense.critical_threshold,
            Duration::from_secs(config.defense.default_ban_seconds),
            config.defense.active_defense,
            alert_sink,
            Arc::clone(&blocklist),
            Arc::clone(&stats),
        ));

        let store = self.store.unwrap_or_else(|| {
            Box::new(ClickHouseClient::new(
                config.storage.clickhouse_url.clone(),
                config.storage.clickhouse_table.clone(),
            ))
        });
        let storage = Arc::new(StorageBatcher::new(
            store,
            config.storage.flush_batch_size,
            Duration::from_millis(config.storage.flush_interval_ms),
            Arc::clone(&stats),
        ));

        let (producer, consumer) = ring_buffer(config.ingest.ring_buffer_size);

        tracing::info!(
            ring_slots = config.ingest.ring_buffer_size,
            rules = rules.len(),
            geoip_entries = geoip.entry_count(),
            active_defense = config.defense.active_defense,
            "pipeline components initialized"
        );

        Ok(Pipeline {
            config,
            state: PipelineState::Initialized,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            producer: Some(producer),
            consumer: Some(consumer),
            rules: Some(rules),
            geoip: Some(geoip),
            model: Some(model),
            limiter,
            blocklist,
            alerts,
            storage,
            stats,
            reporter: None,
            ingest_worker: None,
            processing_worker: None,
        })
    }
}

/// 파이프라인 오케스트레이터
///
/// 모든 컴포넌트를 소유하며, `start()`에서 워커 스레드를 스폰하고
/// `stop()`에서 조인합니다.
pub struct Pipeline {
    config: VigilConfig,
    state: PipelineState,
    /// 종료 신호 플래그 (처리 스레드가 루프 경계에서 검사)
    running: Arc<AtomicBool>,
    /// 수집 측 취소 토큰 (이벤트 루프를 깨움)
    cancel: CancellationToken,

    // start()에서 워커로 이동하는 컴포넌트
    producer: Option<RingProducer>,
    consumer: Option<RingConsumer>,
    rules: Option<RuleEngine>,
    geoip: Option<GeoIpService>,
    model: Option<Box<dyn AnomalyModel>>,

    limiter: Arc<RateLimiter>,
    blocklist: Arc<BlockList>,
    alerts: Arc<AlertManager>,
    storage: Arc<StorageBatcher>,
    stats: Arc<PipelineStats>,

    reporter: Option<StatsReporter>,
    ingest_worker: Option<JoinHandle<()>>,
    processing_worker: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// 워커 스레드를 스폰하고 파이프라인을 가동합니다.
    ///
    /// 수신 소켓은 이 시점에 동기적으로 바인드되며, 실패는 치명적입니다.
    pub fn start(&mut self) -> Result<(), VigilError> {
        if self.state == PipelineState::Running {
            return Ok(());
        }

        tracing::info!("starting pipeline workers");
        self.running.store(true, Ordering::SeqCst);

        // 바인드 실패는 여기서 치명적 오류로 전파
        let udp_addr = format!("0.0.0.0:{}", self.config.ingest.udp_port);
        let udp_socket = std::net::UdpSocket::bind(&udp_addr).map_err(|e| {
            VigilError::from(IngestError::Bind {
                kind: "udp",
                addr: udp_addr,
                reason: e.to_string(),
            })
        })?;

        let tcp_addr = format!("0.0.0.0:{}", self.config.ingest.tcp_port);
        let tcp_listener = std::net::TcpListener::bind(&tcp_addr).map_err(|e| {
            VigilError::from(IngestError::Bind {
                kind: "tcp",
                addr: tcp_addr,
                reason: e.to_string(),
            })
        })?;

        self.spawn_ingest_worker(udp_socket, tcp_listener)?;
        self.spawn_processing_worker()?;

        if self.config.metrics.heartbeat_interval_secs > 0 {
            self.reporter = Some(StatsReporter::start(
                Arc::clone(&self.stats),
                Duration::from_secs(self.config.metrics.heartbeat_interval_secs),
            ));
        }

        self.state = PipelineState::Running;
        tracing::info!("pipeline active");
        Ok(())
    }

    /// 수집 스레드: 단일 스레드 이벤트 루프 위의 수신기들
    fn spawn_ingest_worker(
        &mut self,
        udp_socket: std::net::UdpSocket,
        tcp_listener: std::net::TcpListener,
    ) -> Result<(), VigilError> {
        let producer = self
            .producer
            .take()
            .expect("ingest worker already consumed the ring producer");
        let limiter = Arc::clone(&self.limiter);
        let stats = Arc::clone(&self.stats);
        let cancel = self.cancel.clone();
        let limiter_sweep = Duration::from_secs(self.config.defense.cooldown_seconds);

        let worker = std::thread::Builder::new()
            .name(INGEST_THREAD_NAME.to_owned())
            .spawn(move || {
                pin_current_thread_to_core(0);
                set_realtime_priority(90);

                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build ingest runtime");
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    let producer = Rc::new(RefCell::new(producer));

                    let udp = UdpCollector::new(
                        UdpCollectorConfig::default(),
                        udp_socket,
                        Rc::clone(&producer),
                        Arc::clone(&limiter),
                        Arc::clone(&stats),
                        cancel.clone(),
                    );
                    let tcp = TcpCollector::new(
                        TcpCollectorConfig::default(),
                        tcp_listener,
                        Rc::clone(&producer),
                        Arc::clone(&limiter),
                        Arc::clone(&stats),
                        cancel.clone(),
                    );

                    let udp_task = tokio::task::spawn_local(async move {
                        if let Err(e) = udp.run().await {
                            tracing::error!(error = %e, "udp collector terminated");
                        }
                    });
                    let tcp_task = tokio::task::spawn_local(async move {
                        if let Err(e) = tcp.run().await {
                            tracing::error!(error = %e, "tcp collector terminated");
                        }
                    });

                    // 레이트리미터 유휴 엔트리 정리
                    let sweep_cancel = cancel.clone();
                    let sweep_task = tokio::task::spawn_local(async move {
                        let mut ticker = tokio::time::interval(limiter_sweep);
                        ticker.set_missed_tick_behavior(
                            tokio::time::MissedTickBehavior::Skip,
                        );
                        loop {
                            tokio::select! {
                                _ = ticker.tick() => limiter.cleanup(),
                                () = sweep_cancel.cancelled() => break,
                            }
                        }
                    });

                    let _ = udp_task.await;
                    let _ = tcp_task.await;
                    let _ = sweep_task.await;
                });

                tracing::info!("ingest worker exited");
            })
            .map_err(VigilError::from)?;

        self.ingest_worker = Some(worker);
        Ok(())
    }

    /// 처리 스레드: 드레인 -> 파싱 -> 보강 -> 판정 -> 디스패치
    fn spawn_processing_worker(&mut self) -> Result<(), VigilError> {
        let consumer = self
            .consumer
            .take()
            .expect("processing worker already consumed the ring consumer");
        let rules = self.rules.take().expect("rule engine already consumed");
        let geoip = self.geoip.take().expect("geoip service already consumed");
        let model = self.model.take().expect("anomaly model already consumed");

        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let alerts = Arc::clone(&self.alerts);
        let storage = Arc::clone(&self.storage);
        let batch_size = self.config.detection.batch_size;
        let anomaly_threshold = self.config.detection.anomaly_threshold;

        let worker = std::thread::Builder::new()
            .name(PROCESSING_THREAD_NAME.to_owned())
            .spawn(move || {
                pin_current_thread_to_core(1);
                set_realtime_priority(80);

                processing_loop(
                    consumer,
                    &rules,
                    &geoip,
                    model.as_ref(),
                    &alerts,
                    &storage,
                    &stats,
                    &running,
                    batch_size,
                    anomaly_threshold,
                );

                tracing::info!("processing worker exited");
            })
            .map_err(VigilError::from)?;

        self.processing_worker = Some(worker);
        Ok(())
    }

    /// 파이프라인을 우아하게 정지합니다.
    ///
    /// 워커는 진행 중인 반복을 마친 뒤 종료하고, 잔여 스토리지 배치는
    /// 조인 완료 전에 플러시됩니다.
    pub fn stop(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        tracing::warn!("stopping pipeline");

        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        if let Some(worker) = self.ingest_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.processing_worker.take() {
            let _ = worker.join();
        }
        if let Some(mut reporter) = self.reporter.take() {
            reporter.stop();
        }

        // 잔여 배치 플러시 (Arc 공유 중이므로 명시적 shutdown 대신
        // 마지막 소유자의 drop에 맡기지 않고 직접 수행)
        if let Some(storage) = Arc::get_mut(&mut self.storage) {
            storage.shutdown();
        }

        self.state = PipelineState::Stopped;
        tracing::info!("pipeline stopped");
    }

    /// 파이프라인 카운터 핸들을 반환합니다.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// 차단 목록 핸들을 반환합니다.
    pub fn blocklist(&self) -> Arc<BlockList> {
        Arc::clone(&self.blocklist)
    }

    /// 파이프라인이 실행 중인지 확인합니다.
    pub fn is_running(&self) -> bool {
        self.state == PipelineState::Running
    }

    /// 현재 상태 이름을 반환합니다.
    pub fn state_name(&self) -> &'static str {
        match self.state {
            PipelineState::Initialized => "initialized",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 단일 로그의 판정을 계산합니다.
///
/// 규칙이 먼저 평가되고, 매칭 시 모델 추론은 생략됩니다 (short-circuit).
/// 추론 실패는 0.0점(정상)으로 취급됩니다.
fn classify(
    log: &ParsedLog,
    rules: &RuleEngine,
    model: &dyn AnomalyModel,
    anomaly_threshold: f32,
    stats: &PipelineStats,
) -> Verdict {
    if let Some(rule_name) = rules.evaluate(log) {
        return Verdict::RuleHit {
            rule_name: rule_name.to_owned(),
        };
    }

    let score = match model.score(&log.features) {
        Ok(score) => score,
        Err(e) => {
            tracing::debug!(error = %e, "inference failed, treating as benign");
            0.0
        }
    };
    stats.inc_inferences(1);

    if score > anomaly_threshold {
        Verdict::Anomaly { score }
    } else {
        Verdict::Benign { score }
    }
}

/// 처리 워커의 본체 — busy-yield 마이크로배칭 루프
#[allow(clippy::too_many_arguments)]
fn processing_loop(
    mut consumer: RingConsumer,
    rules: &RuleEngine,
    geoip: &GeoIpService,
    model: &dyn AnomalyModel,
    alerts: &AlertManager,
    storage: &StorageBatcher,
    stats: &PipelineStats,
    running: &AtomicBool,
    batch_size: usize,
    anomaly_threshold: f32,
) {
    let mut batch: Vec<ParsedLog> = Vec::with_capacity(batch_size);
    let mut raw = RawLogEvent::default();
    let mut cleanup_counter: u64 = 0;

    while running.load(Ordering::Relaxed) {
        // 1. 마이크로배칭: 링에서 최대 batch_size개 드레인
        let mut collected = 0;
        while collected < batch_size && consumer.pop(&mut raw) {
            collected += 1;
            match parser::parse_event(&raw) {
                Ok(log) => batch.push(log),
                Err(e) => {
                    stats.inc_parse_errors(1);
                    tracing::debug!(source = %raw.source(), error = %e, "parse failed, skipping record");
                }
            }
        }

        // 링이 비었으면 양보 후 재시도
        if collected == 0 {
            cleanup_counter += 1;
            if cleanup_counter.is_multiple_of(1_000_000) {
                alerts.cleanup();
            }
            std::thread::yield_now();
            continue;
        }

        // 2. 로그별 판정 루프
        for log in &mut batch {
            // A. GeoIP 보강
            if let Some(location) = geoip.lookup(&log.host) {
                log.country = location.country_iso.clone();
                log.latitude = location.latitude;
                log.longitude = location.longitude;
            }

            // B/C. 시그니처 우선, 미스 시 모델 추론
            let verdict = classify(log, rules, model, anomaly_threshold, stats);

            // D. 능동 대응
            if verdict.is_critical() {
                stats.inc_threats(1);
                alerts.trigger(&log.host, verdict.score(), &verdict.reason());
            }

            // E. 영속화 (규칙 action과 무관하게 모든 로그 저장)
            storage.enqueue(log, verdict.score(), verdict.is_critical());
        }

        // 3. 배치 버퍼 정리
        batch.clear();
    }
}
