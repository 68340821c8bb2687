//! TCP 수신기 — newline 프레이밍 스트림 수집
//!
//! 수락된 연결마다 세션을 만들고, 수신 청크에 newline 프레이밍을
//! 적용하여 프레임 하나를 링 이벤트 하나로 전달합니다. 종료되지 않은
//! 잔여 바이트는 세션별 sticky buffer에 보관되어 다음 read와 이어집니다.
//!
//! 원격 쉬퍼의 선두 `HELLO AGENT_ID=<id>` 라인은 별도 핸드셰이크 상태 없이
//! 일반 프레임과 동일하게 처리됩니다.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_core::error::IngestError;

use crate::limiter::RateLimiter;
use crate::ring::RingProducer;
use crate::stats::PipelineStats;

/// 세션당 read 버퍼 크기
const READ_MAX: usize = 4096;

/// newline 없이 허용되는 sticky buffer 최대 크기.
/// 초과 시 버퍼 전체를 폐기합니다 (무한 라인 방어).
const FRAME_MAX: usize = 8192;

/// TCP 수신기 설정
#[derive(Debug, Clone)]
pub struct TcpCollectorConfig {
    /// sticky buffer 초기 예약 크기 (바이트)
    pub sticky_reserve: usize,
}

impl Default for TcpCollectorConfig {
    fn default() -> Self {
        Self {
            sticky_reserve: 4096,
        }
    }
}

/// TCP 수신기
///
/// 수집 스레드의 LocalSet에서 실행되며, 각 연결은 같은 LocalSet의 개별
/// 태스크로 처리됩니다. `Rc` 핸들을 갖기 때문에 의도적으로 `Send`가
/// 아닙니다.
pub struct TcpCollector {
    config: TcpCollectorConfig,
    listener: std::net::TcpListener,
    producer: Rc<RefCell<RingProducer>>,
    limiter: Arc<RateLimiter>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl TcpCollector {
    /// 사전 바인드된 리스너로 수신기를 생성합니다.
    pub fn new(
        config: TcpCollectorConfig,
        listener: std::net::TcpListener,
        producer: Rc<RefCell<RingProducer>>,
        limiter: Arc<RateLimiter>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            listener,
            producer,
            limiter,
            stats,
            cancel,
        }
    }

    /// 수락 루프를 실행합니다. 취소될 때까지 반환하지 않습니다.
    pub async fn run(self) -> Result<(), IngestError> {
        let local_addr = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());

        self.listener
            .set_nonblocking(true)
            .map_err(|e| IngestError::Bind {
                kind: "tcp",
                addr: local_addr.clone(),
                reason: e.to_string(),
            })?;
        let listener = TcpListener::from_std(self.listener).map_err(|e| IngestError::Bind {
            kind: "tcp",
            addr: local_addr.clone(),
            reason: e.to_string(),
        })?;

        info!(addr = %local_addr, "tcp collector listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = result.map_err(|e| IngestError::Receive {
                        kind: "tcp",
                        reason: e.to_string(),
                    })?;
                    let source = addr.ip().to_string();

                    // 연결 스로틀링: 거부 시 즉시 닫음
                    if !self.limiter.should_allow(&source) {
                        warn!(source = %source, "tcp connection rejected by rate limiter");
                        drop(stream);
                        continue;
                    }

                    debug!(source = %source, "tcp connection accepted");
                    let session = TcpSession::new(
                        stream,
                        Framer::new(
                            source,
                            self.config.sticky_reserve,
                            Rc::clone(&self.producer),
                            Arc::clone(&self.stats),
                        ),
                        Arc::clone(&self.stats),
                        self.cancel.clone(),
                    );
                    tokio::task::spawn_local(session.run());
                }
                () = self.cancel.cancelled() => {
                    info!("tcp collector received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// newline 프레이머 — 세션별 sticky buffer 상태 기계
///
/// 소켓과 분리되어 있어 청크 시퀀스 단위의 단위 테스트가 가능합니다.
/// 어떤 청크 분할에 대해서도 동일한 프레임 시퀀스를 방출합니다.
pub(crate) struct Framer {
    source: String,
    sticky: Vec<u8>,
    producer: Rc<RefCell<RingProducer>>,
    stats: Arc<PipelineStats>,
}

impl Framer {
    pub(crate) fn new(
        source: String,
        sticky_reserve: usize,
        producer: Rc<RefCell<RingProducer>>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            source,
            sticky: Vec::with_capacity(sticky_reserve),
            producer,
            stats,
        }
    }

    /// 수신 청크 하나에 프레이밍을 적용합니다.
    pub(crate) fn ingest_chunk(&mut self, chunk: &[u8]) {
        let mut start = 0;

        loop {
            let Some(offset) = chunk[start..].iter().position(|&b| b == b'\n') else {
                // 더 이상 newline 없음: 잔여를 sticky에 보관
                self.sticky.extend_from_slice(&chunk[start..]);
                if self.sticky.len() > FRAME_MAX {
                    warn!(
                        source = %self.source,
                        size = self.sticky.len(),
                        "oversized frame without newline, discarding sticky buffer"
                    );
                    self.sticky.clear();
                }
                break;
            };

            let newline_pos = start + offset;

            if self.sticky.is_empty() {
                // read 버퍼에서 직접 push (zero-copy 핸드오프)
                self.push_frame_from(chunk, start, newline_pos);
            } else {
                // sticky와 이어붙인 뒤 push
                self.sticky.extend_from_slice(&chunk[start..newline_pos]);
                let frame = std::mem::take(&mut self.sticky);
                self.push_frame(&frame);
                self.sticky = frame;
                self.sticky.clear();
            }

            start = newline_pos + 1;
        }
    }

    fn push_frame_from(&mut self, chunk: &[u8], start: usize, end: usize) {
        if start == end {
            return; // 빈 프레임은 버림
        }
        if !self
            .producer
            .borrow_mut()
            .push(&chunk[start..end], &self.source)
        {
            self.stats.inc_packets_dropped(1);
        }
    }

    fn push_frame(&mut self, frame: &[u8]) {
        if frame.is_empty() {
            return;
        }
        if !self.producer.borrow_mut().push(frame, &self.source) {
            self.stats.inc_packets_dropped(1);
        }
    }
}

/// TCP 세션 — 연결 하나의 read 루프
///
/// 세션 수명은 pending read가 유지합니다. EOF와 취소는 정상 종료,
/// 그 외 I/O 에러는 경고 후 세션을 정리합니다. push 실패는 드롭으로
/// 집계될 뿐 세션을 끊지 않습니다.
struct TcpSession {
    stream: TcpStream,
    framer: Framer,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl TcpSession {
    fn new(
        stream: TcpStream,
        framer: Framer,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            framer,
            stats,
            cancel,
        }
    }

    async fn run(mut self) {
        let mut buf = [0_u8; READ_MAX];

        loop {
            tokio::select! {
                result = self.stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            debug!(source = %self.framer.source, "connection closed by peer");
                            break;
                        }
                        Ok(len) => {
                            // 청크 단위 집계 (프레임 단위 아님)
                            self.stats.inc_packets_received(1);
                            self.framer.ingest_chunk(&buf[..len]);
                        }
                        Err(e) => {
                            warn!(source = %self.framer.source, error = %e, "tcp read error");
                            break;
                        }
                    }
                }
                () = self.cancel.cancelled() => {
                    debug!(source = %self.framer.source, "session received shutdown signal");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{ring_buffer, RawLogEvent, RingConsumer};
    use std::time::Duration;

    fn framer(capacity: usize) -> (Framer, RingConsumer, Arc<PipelineStats>) {
        let (tx, rx) = ring_buffer(capacity);
        let stats = Arc::new(PipelineStats::new());
        let framer = Framer::new(
            "10.0.0.1".to_owned(),
            4096,
            Rc::new(RefCell::new(tx)),
            Arc::clone(&stats),
        );
        (framer, rx, stats)
    }

    fn drain(rx: &mut RingConsumer) -> Vec<Vec<u8>> {
        let mut out = RawLogEvent::default();
        let mut frames = Vec::new();
        while rx.pop(&mut out) {
            frames.push(out.payload().to_vec());
        }
        frames
    }

    #[test]
    fn single_complete_line() {
        let (mut framer, mut rx, _stats) = framer(16);
        framer.ingest_chunk(b"hello world\n");
        assert_eq!(drain(&mut rx), vec![b"hello world".to_vec()]);
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let (mut framer, mut rx, _stats) = framer(16);
        framer.ingest_chunk(b"one\ntwo\nthree\n");
        assert_eq!(
            drain(&mut rx),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn sticky_buffer_joins_split_line() {
        // "foo" + "bar\nbaz" + "\nqux\n" -> "foobar", "baz", "qux"
        let (mut framer, mut rx, _stats) = framer(16);
        framer.ingest_chunk(b"foo");
        framer.ingest_chunk(b"bar\nbaz");
        framer.ingest_chunk(b"\nqux\n");
        assert_eq!(
            drain(&mut rx),
            vec![b"foobar".to_vec(), b"baz".to_vec(), b"qux".to_vec()]
        );
    }

    #[test]
    fn frames_identical_for_any_chunking() {
        let stream = b"alpha\nbravo charlie\ndelta\necho foxtrot golf\n";

        // 바이트 단위 분할
        let (mut framer_a, mut rx_a, _s) = framer(64);
        for byte in stream.iter() {
            framer_a.ingest_chunk(std::slice::from_ref(byte));
        }

        // 통짜 청크
        let (mut framer_b, mut rx_b, _s) = framer(64);
        framer_b.ingest_chunk(stream);

        // 불규칙 분할
        let (mut framer_c, mut rx_c, _s) = framer(64);
        framer_c.ingest_chunk(&stream[..7]);
        framer_c.ingest_chunk(&stream[7..8]);
        framer_c.ingest_chunk(&stream[8..29]);
        framer_c.ingest_chunk(&stream[29..]);

        let expected = drain(&mut rx_b);
        assert_eq!(drain(&mut rx_a), expected);
        assert_eq!(drain(&mut rx_c), expected);
    }

    #[test]
    fn oversized_line_discards_sticky_and_keeps_session_state() {
        let (mut framer, mut rx, _stats) = framer(16);

        // newline 없이 FRAME_MAX 초과 누적
        framer.ingest_chunk(&vec![b'x'; FRAME_MAX]);
        framer.ingest_chunk(&[b'y'; 10]);
        assert!(framer.sticky.is_empty());

        // 이후 정상 라인은 계속 처리됨
        framer.ingest_chunk(b"next line\n");
        assert_eq!(drain(&mut rx), vec![b"next line".to_vec()]);
    }

    #[test]
    fn push_failure_counts_drop_without_breaking_framer() {
        // 용량 2 = 이벤트 1개 수용
        let (mut framer, mut rx, stats) = framer(2);
        framer.ingest_chunk(b"first\nsecond\nthird\n");

        assert_eq!(drain(&mut rx), vec![b"first".to_vec()]);
        assert_eq!(stats.snapshot().packets_dropped, 2);
    }

    #[test]
    fn empty_lines_are_skipped() {
        let (mut framer, mut rx, _stats) = framer(16);
        framer.ingest_chunk(b"\n\na\n\n");
        assert_eq!(drain(&mut rx), vec![b"a".to_vec()]);
    }

    #[test]
    fn hello_line_is_an_ordinary_frame() {
        let (mut framer, mut rx, _stats) = framer(16);
        framer.ingest_chunk(b"HELLO AGENT_ID=edge-7\n<34>sshd: login\n");
        let frames = drain(&mut rx);
        assert_eq!(frames[0], b"HELLO AGENT_ID=edge-7".to_vec());
        assert_eq!(frames[1], b"<34>sshd: login".to_vec());
    }

    #[tokio::test]
    async fn end_to_end_session_over_socket() {
        use tokio::io::AsyncWriteExt;

        let (tx, mut rx) = ring_buffer(16);
        let producer = Rc::new(RefCell::new(tx));
        let stats = Arc::new(PipelineStats::new());
        let limiter = Arc::new(RateLimiter::new(100.0, 500.0, Duration::from_secs(3000)));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let collector = TcpCollector::new(
            TcpCollectorConfig::default(),
            listener,
            producer,
            limiter,
            Arc::clone(&stats),
            cancel.clone(),
        );

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let handle = tokio::task::spawn_local(collector.run());

                let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
                client.write_all(b"foo").await.unwrap();
                client.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                client.write_all(b"bar\nbaz").await.unwrap();
                client.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                client.write_all(b"\nqux\n").await.unwrap();
                client.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;

                drop(client);
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
                handle.await.unwrap().unwrap();
            })
            .await;

        let mut out = RawLogEvent::default();
        let mut frames = Vec::new();
        while rx.pop(&mut out) {
            frames.push(out.payload().to_vec());
        }
        assert_eq!(
            frames,
            vec![b"foobar".to_vec(), b"baz".to_vec(), b"qux".to_vec()]
        );
        // 청크당 1회 집계 (3회 write)
        assert!(stats.snapshot().packets_received >= 3);
    }

    #[tokio::test]
    async fn rate_limited_connection_is_closed() {
        let (tx, _rx) = ring_buffer(16);
        let producer = Rc::new(RefCell::new(tx));
        let stats = Arc::new(PipelineStats::new());
        // 버스트 1: 두 번째 연결은 거부
        let limiter = Arc::new(RateLimiter::new(0.001, 1.0, Duration::from_secs(3000)));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let collector = TcpCollector::new(
            TcpCollectorConfig::default(),
            listener,
            producer,
            limiter,
            stats,
            cancel.clone(),
        );

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let handle = tokio::task::spawn_local(collector.run());

                let _first = tokio::net::TcpStream::connect(addr).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;

                let mut second = tokio::net::TcpStream::connect(addr).await.unwrap();
                // 거부된 연결은 서버 측에서 닫히므로 read가 0을 반환
                let mut buf = [0_u8; 8];
                let n = tokio::time::timeout(
                    Duration::from_secs(2),
                    second.read(&mut buf),
                )
                .await
                .expect("server should close rejected connection")
                .unwrap();
                assert_eq!(n, 0);

                cancel.cancel();
                handle.await.unwrap().unwrap();
            })
            .await;
    }
}
