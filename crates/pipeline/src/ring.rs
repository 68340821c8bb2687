//! SPSC 링 버퍼 — 수집 스레드와 처리 스레드 사이의 락프리 핸드오프
//!
//! 고정 용량 슬롯 배열 위에서 동작하는 단일 생산자/단일 소비자 큐입니다.
//! 슬롯은 시작 시 한 번에 할당되며 런타임 중 재할당이 없습니다.
//!
//! # 메모리 순서 계약
//!
//! - 생산자: `head`를 relaxed로 읽고, `tail`을 acquire로 읽어 포화를 감지하며,
//!   페이로드 기록 후 `head`를 release로 발행합니다.
//! - 소비자: `tail`을 relaxed로 읽고, `head`를 acquire로 읽어 공백을 감지하며,
//!   복사 완료 후 `tail`을 release로 발행합니다.
//!
//! 이 순서는 필수입니다. 더 약한 순서는 부분 기록된 페이로드의 torn read를
//! 허용합니다.
//!
//! # 오버플로우 정책
//!
//! 버퍼는 절대 블로킹하지 않습니다. 포화 시 `push`는 false를 반환하고
//! 호출자가 드롭 카운터를 증가시킵니다. `PAYLOAD_MAX`를 초과하는 페이로드는
//! 드롭하지 않고 잘라서 기록합니다.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 슬롯 페이로드 최대 크기 (바이트). 초과분은 잘립니다.
pub const PAYLOAD_MAX: usize = 4096;

/// 슬롯 소스 주소 최대 크기 (바이트)
pub const SOURCE_MAX: usize = 64;

/// 링 버퍼 기본 슬롯 수
pub const DEFAULT_CAPACITY: usize = 65536;

/// 링 슬롯에 저장되는 원시 로그 이벤트
///
/// 값 타입이며 슬롯 안에서만 살아있습니다. 소비자는 생산자가 슬롯을
/// 덮어쓰기 전에 값 복사로 꺼냅니다.
#[derive(Clone, Copy)]
pub struct RawLogEvent {
    /// 수신 시각 (UNIX epoch 기준 나노초, push 시점에 기록)
    pub timestamp_ns: u64,
    payload_len: u32,
    source_len: u8,
    payload: [u8; PAYLOAD_MAX],
    source: [u8; SOURCE_MAX],
}

impl RawLogEvent {
    const EMPTY: Self = Self {
        timestamp_ns: 0,
        payload_len: 0,
        source_len: 0,
        payload: [0; PAYLOAD_MAX],
        source: [0; SOURCE_MAX],
    };

    /// 페이로드 바이트를 반환합니다.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    /// 소스 주소 문자열을 반환합니다.
    pub fn source(&self) -> &str {
        std::str::from_utf8(&self.source[..self.source_len as usize]).unwrap_or("")
    }
}

impl Default for RawLogEvent {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for RawLogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawLogEvent")
            .field("timestamp_ns", &self.timestamp_ns)
            .field("payload_len", &self.payload_len)
            .field("source", &self.source())
            .finish_non_exhaustive()
    }
}

/// UNIX epoch 기준 나노초를 반환합니다.
pub(crate) fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

struct Shared {
    slots: Box<[UnsafeCell<RawLogEvent>]>,
    /// 생산자만 변경. `(head + 1) & mask == tail`이면 포화.
    head: AtomicUsize,
    /// 소비자만 변경. `head == tail`이면 공백.
    tail: AtomicUsize,
    mask: usize,
}

// SAFETY: 슬롯 접근은 head/tail 프로토콜로 분리됩니다. 생산자는 head 슬롯만
// 쓰고, 소비자는 tail 슬롯만 읽습니다. head의 release 발행이 페이로드 기록을
// 소비자의 acquire 관찰보다 먼저 완료시키므로, 동일 슬롯에 대한 동시 접근은
// 발생하지 않습니다.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// SPSC 링 버퍼를 생성하고 생산자/소비자 핸들로 분리합니다.
///
/// # Panics
/// `capacity`가 2의 거듭제곱이 아니거나 2보다 작으면 패닉합니다.
/// (용량 검증은 설정 단계에서 수행됩니다.)
pub fn ring_buffer(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(
        capacity.is_power_of_two() && capacity >= 2,
        "ring capacity must be a power of two >= 2, got {capacity}"
    );

    // 시작 시 일괄 할당. 런타임 중 지연 스파이크를 방지합니다.
    let slots: Box<[UnsafeCell<RawLogEvent>]> = (0..capacity)
        .map(|_| UnsafeCell::new(RawLogEvent::EMPTY))
        .collect();

    let shared = Arc::new(Shared {
        slots,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        mask: capacity - 1,
    });

    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

/// 링 버퍼 생산자 핸들
///
/// 정확히 하나의 스레드만 소유해야 합니다. `Clone`을 구현하지 않으므로
/// 단일 생산자 규약이 타입 수준에서 강제됩니다.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// 슬롯에 이벤트를 기록합니다.
    ///
    /// 수신 타임스탬프는 이 호출 시점에 기록됩니다. 포화 상태이면 아무것도
    /// 기록하지 않고 false를 반환합니다. 페이로드가 [`PAYLOAD_MAX`]를
    /// 초과하면 잘라서 기록합니다.
    pub fn push(&mut self, payload: &[u8], source: &str) -> bool {
        let current_head = self.shared.head.load(Ordering::Relaxed);
        let next_head = (current_head + 1) & self.shared.mask;

        // acquire: 소비자의 최신 tail 발행을 관찰
        if next_head == self.shared.tail.load(Ordering::Acquire) {
            return false;
        }

        // SAFETY: head 슬롯은 생산자 전용이며, 위의 포화 검사로 소비자가
        // 아직 이 슬롯을 읽고 있지 않음이 보장됩니다.
        let slot = unsafe { &mut *self.shared.slots[current_head].get() };

        slot.timestamp_ns = epoch_nanos();

        let payload_len = payload.len().min(PAYLOAD_MAX);
        slot.payload[..payload_len].copy_from_slice(&payload[..payload_len]);
        slot.payload_len = payload_len as u32;

        let source_bytes = source.as_bytes();
        let source_len = source_bytes.len().min(SOURCE_MAX);
        slot.source[..source_len].copy_from_slice(&source_bytes[..source_len]);
        slot.source_len = source_len as u8;

        // release: 페이로드 기록이 head 발행보다 먼저 보이도록 커밋
        self.shared.head.store(next_head, Ordering::Release);
        true
    }

    /// 현재 저장된 이벤트 수의 근사값을 반환합니다.
    pub fn len(&self) -> usize {
        let head = self.shared.head.load(Ordering::Relaxed);
        let tail = self.shared.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & self.shared.mask
    }

    /// 버퍼가 비어있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 링 버퍼 소비자 핸들
///
/// 정확히 하나의 스레드만 소유해야 합니다.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// tail 슬롯의 이벤트를 `out`으로 값 복사합니다.
    ///
    /// 버퍼가 비어있으면 false를 반환합니다.
    pub fn pop(&mut self, out: &mut RawLogEvent) -> bool {
        let current_tail = self.shared.tail.load(Ordering::Relaxed);

        // acquire: 생산자의 최신 head 발행(및 그 이전의 페이로드 기록)을 관찰
        if current_tail == self.shared.head.load(Ordering::Acquire) {
            return false;
        }

        // SAFETY: tail 슬롯은 소비자 전용이며, 위의 공백 검사로 생산자가
        // 이 슬롯에 기록을 완료했음이 보장됩니다.
        *out = unsafe { *self.shared.slots[current_tail].get() };

        let next_tail = (current_tail + 1) & self.shared.mask;

        // release: 복사 완료 후에 tail을 발행
        self.shared.tail.store(next_tail, Ordering::Release);
        true
    }

    /// 현재 저장된 이벤트 수의 근사값을 반환합니다.
    pub fn len(&self) -> usize {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail) & self.shared.mask
    }

    /// 버퍼가 비어있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pop_single_event() {
        let (mut tx, mut rx) = ring_buffer(8);
        assert!(tx.push(b"hello", "10.0.0.1"));

        let mut out = RawLogEvent::default();
        assert!(rx.pop(&mut out));
        assert_eq!(out.payload(), b"hello");
        assert_eq!(out.source(), "10.0.0.1");
        assert!(out.timestamp_ns > 0);
    }

    #[test]
    fn pop_from_empty_fails() {
        let (_tx, mut rx) = ring_buffer(8);
        let mut out = RawLogEvent::default();
        assert!(!rx.pop(&mut out));
    }

    #[test]
    fn push_fails_when_full() {
        // 용량 8 링은 슬롯 하나를 비워두므로 7개까지 수용
        let (mut tx, mut rx) = ring_buffer(8);
        for i in 0..7 {
            assert!(tx.push(format!("log{i}").as_bytes(), "src"), "push {i}");
        }
        assert!(!tx.push(b"overflow", "src"));

        // 기존 이벤트는 순서대로 그대로 남아있음
        let mut out = RawLogEvent::default();
        for i in 0..7 {
            assert!(rx.pop(&mut out));
            assert_eq!(out.payload(), format!("log{i}").as_bytes());
        }
        assert!(!rx.pop(&mut out));
    }

    #[test]
    fn oversized_payload_is_truncated_not_dropped() {
        let (mut tx, mut rx) = ring_buffer(8);
        let big = vec![0xAB_u8; PAYLOAD_MAX + 1000];
        assert!(tx.push(&big, "src"));

        let mut out = RawLogEvent::default();
        assert!(rx.pop(&mut out));
        assert_eq!(out.payload().len(), PAYLOAD_MAX);
        assert!(out.payload().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn wraparound_preserves_fifo_order() {
        let (mut tx, mut rx) = ring_buffer(4);
        let mut out = RawLogEvent::default();

        // 인덱스가 여러 번 래핑되도록 반복
        for round in 0..10 {
            for i in 0..3 {
                assert!(tx.push(format!("r{round}i{i}").as_bytes(), "src"));
            }
            for i in 0..3 {
                assert!(rx.pop(&mut out));
                assert_eq!(out.payload(), format!("r{round}i{i}").as_bytes());
            }
        }
    }

    #[test]
    fn len_tracks_occupancy() {
        let (mut tx, mut rx) = ring_buffer(8);
        assert!(tx.is_empty());
        tx.push(b"a", "s");
        tx.push(b"b", "s");
        assert_eq!(tx.len(), 2);
        assert_eq!(rx.len(), 2);

        let mut out = RawLogEvent::default();
        rx.pop(&mut out);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn long_source_is_truncated() {
        let (mut tx, mut rx) = ring_buffer(8);
        let long_source = "x".repeat(SOURCE_MAX + 10);
        assert!(tx.push(b"payload", &long_source));

        let mut out = RawLogEvent::default();
        assert!(rx.pop(&mut out));
        assert_eq!(out.source().len(), SOURCE_MAX);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_capacity_panics() {
        let _ = ring_buffer(1000);
    }

    #[test]
    fn saturated_cross_thread_payloads_are_never_torn() {
        // 전체 포화 상태에서 생산자 순서와 페이로드 무결성을 검증
        let (mut tx, mut rx) = ring_buffer(64);
        const TOTAL: u64 = 100_000;

        let producer = std::thread::spawn(move || {
            let mut accepted: u64 = 0;
            let mut rejected: u64 = 0;
            let mut seq: u64 = 0;
            while seq < TOTAL {
                // 시퀀스 번호로 전체 페이로드를 채워 torn read를 감지 가능하게 함
                let fill = (seq % 251) as u8;
                let mut payload = [fill; 512];
                payload[..8].copy_from_slice(&seq.to_le_bytes());
                if tx.push(&payload, "10.0.0.1") {
                    accepted += 1;
                    seq += 1;
                } else {
                    rejected += 1;
                    std::thread::yield_now();
                }
            }
            (accepted, rejected)
        });

        let consumer = std::thread::spawn(move || {
            let mut out = RawLogEvent::default();
            let mut expected_seq: u64 = 0;
            while expected_seq < TOTAL {
                if !rx.pop(&mut out) {
                    std::thread::yield_now();
                    continue;
                }
                let payload = out.payload();
                assert_eq!(payload.len(), 512);
                let seq = u64::from_le_bytes(payload[..8].try_into().unwrap());
                assert_eq!(seq, expected_seq, "events reordered");
                let fill = (seq % 251) as u8;
                assert!(
                    payload[8..].iter().all(|&b| b == fill),
                    "torn payload at seq {seq}"
                );
                expected_seq += 1;
            }
        });

        let (accepted, _rejected) = producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(accepted, TOTAL);
    }
}
