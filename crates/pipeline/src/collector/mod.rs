//! 네트워크 수신기 — 수집 스레드의 이벤트 소스
//!
//! # 수신 소스
//! - [`UdpCollector`]: 데이터그램 하나 = 로그 하나
//! - [`TcpCollector`]: newline 구분 스트림, 연결별 세션과 sticky buffer
//!
//! # 아키텍처
//! 모든 수신기는 수집 스레드의 단일 스레드 런타임(LocalSet) 위에서
//! 직렬로 실행되며, `Rc<RefCell<RingProducer>>`를 공유합니다. 링 버퍼의
//! 단일 생산자 규약은 이 직렬 실행으로 보장됩니다.
//!
//! 수신 허용 판정(레이트리밋)과 링 push 실패는 모두 드롭 카운터로
//! 집계되며, 업스트림으로의 역압 신호는 없습니다.

pub mod tcp;
pub mod udp;

pub use tcp::{TcpCollector, TcpCollectorConfig};
pub use udp::{UdpCollector, UdpCollectorConfig};
