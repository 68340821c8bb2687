//! vigil-pipeline — 수집에서 판정까지의 전체 엔진
//!
//! # 모듈 구성
//!
//! - [`ring`]: 고정 용량 SPSC 링 버퍼 (수집 스레드 -> 처리 스레드 핸드오프)
//! - [`limiter`]: 소스별 토큰 버킷 레이트리미터
//! - [`collector`]: UDP/TCP 수신기 (newline framing, sticky buffer)
//! - [`parser`]: 원시 이벤트 -> 구조화 레코드 + 피처 임베딩
//! - [`enrich`]: GeoIP 보강 서비스
//! - [`rules`]: 시그니처 규칙 엔진 (first-match, 정규식 캐싱)
//! - [`infer`]: 이상 탐지 모델 인터페이스
//! - [`alert`]: 알림 쿨다운 및 능동 대응 디스패치
//! - [`blocklist`]: 방화벽 차단 수명주기 관리
//! - [`publish`]: pub/sub 알림 발행
//! - [`storage`]: 배치 누적 및 ClickHouse 플러시
//! - [`stats`]: 핫패스 카운터 및 주기 리포터
//! - [`pipeline`]: 전체 오케스트레이션 (스레드 스폰/피닝, 마이크로배칭 루프)
//!
//! # 아키텍처
//!
//! ```text
//! UDP/TCP -> RateLimiter -> RingBuffer -> drain/parse -> enrich -> rules ----hit----> Alert -> BlockList
//!                                                                   |                   |        + pub/sub
//!                                                                  miss                 |
//!                                                                   v                   |
//!                                                              AnomalyModel -> score ---+
//!                                                                   |
//!                                                                   v
//!                                                            StorageBatcher -> ClickHouse
//! ```

pub mod alert;
pub mod blocklist;
pub mod collector;
pub mod enrich;
pub mod infer;
pub mod limiter;
pub mod parser;
pub mod pipeline;
pub mod publish;
pub mod ring;
pub mod rules;
pub mod stats;
pub mod storage;

mod thread;

// --- 주요 타입 re-export ---

// 오케스트레이션
pub use pipeline::{Pipeline, PipelineBuilder};

// 링 버퍼
pub use ring::{RawLogEvent, RingConsumer, RingProducer, PAYLOAD_MAX};

// 레이트리미터
pub use limiter::RateLimiter;

// 탐지
pub use infer::{AnomalyModel, BaselineModel};
pub use rules::{Rule, RuleAction, RuleEngine, RuleField};

// 능동 방어
pub use alert::AlertManager;
pub use blocklist::{BlockList, FirewallAdapter, IptablesFirewall};

// 싱크
pub use publish::{AlertSink, RedisPublisher};
pub use storage::{ClickHouseClient, LogStore, StorageBatcher};

// 카운터
pub use stats::PipelineStats;
