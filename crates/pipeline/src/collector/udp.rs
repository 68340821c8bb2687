//! UDP 수신기
//!
//! syslog 스타일 데이터그램을 수신합니다. 재조립 없이 데이터그램 하나를
//! 로그 이벤트 하나로 취급하며, 수신 즉시 다음 수신을 재개합니다.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use vigil_core::error::IngestError;

use crate::limiter::RateLimiter;
use crate::ring::{RingProducer, PAYLOAD_MAX};
use crate::stats::PipelineStats;

/// UDP 수신기 설정
#[derive(Debug, Clone)]
pub struct UdpCollectorConfig {
    /// 수신 버퍼 크기 (바이트). 페이로드 상한과 동일하게 유지.
    pub recv_buffer_size: usize,
}

impl Default for UdpCollectorConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: PAYLOAD_MAX,
        }
    }
}

/// UDP 수신기
///
/// 수집 스레드의 LocalSet에서 실행됩니다. `Rc` 핸들을 갖기 때문에
/// 의도적으로 `Send`가 아닙니다.
pub struct UdpCollector {
    config: UdpCollectorConfig,
    socket: std::net::UdpSocket,
    producer: Rc<RefCell<RingProducer>>,
    limiter: Arc<RateLimiter>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl UdpCollector {
    /// 사전 바인드된 소켓으로 수신기를 생성합니다.
    ///
    /// 소켓은 오케스트레이터가 시작 시점에 동기적으로 바인드합니다
    /// (바인드 실패는 치명적 시작 오류).
    pub fn new(
        config: UdpCollectorConfig,
        socket: std::net::UdpSocket,
        producer: Rc<RefCell<RingProducer>>,
        limiter: Arc<RateLimiter>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            socket,
            producer,
            limiter,
            stats,
            cancel,
        }
    }

    /// 수신 루프를 실행합니다. 취소될 때까지 반환하지 않습니다.
    pub async fn run(self) -> Result<(), IngestError> {
        let local_addr = self
            .socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());

        self.socket
            .set_nonblocking(true)
            .map_err(|e| IngestError::Bind {
                kind: "udp",
                addr: local_addr.clone(),
                reason: e.to_string(),
            })?;
        let socket = UdpSocket::from_std(self.socket).map_err(|e| IngestError::Bind {
            kind: "udp",
            addr: local_addr.clone(),
            reason: e.to_string(),
        })?;

        info!(addr = %local_addr, "udp collector listening");

        let mut buf = vec![0_u8; self.config.recv_buffer_size];

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, addr) = result.map_err(|e| IngestError::Receive {
                        kind: "udp",
                        reason: e.to_string(),
                    })?;
                    self.stats.inc_packets_received(1);

                    if len == 0 {
                        continue;
                    }

                    let source = addr.ip().to_string();
                    if !self.limiter.should_allow(&source) {
                        self.stats.inc_packets_dropped(1);
                        debug!(source = %source, "datagram denied by rate limiter");
                        continue;
                    }

                    if !self.producer.borrow_mut().push(&buf[..len], &source) {
                        self.stats.inc_packets_dropped(1);
                    }
                }
                () = self.cancel.cancelled() => {
                    info!("udp collector received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }
}
