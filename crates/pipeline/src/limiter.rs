//! 소스별 토큰 버킷 레이트리미터 — 수집 표면의 DoS 보호
//!
//! 소스 식별자(IP 주소 문자열)별로 토큰 버킷을 유지합니다.
//! 버킷은 접근 시점에 지연 보충(lazy refill)되며, 수신 프레임당 최대 한 번
//! 호출되는 마이크로초 규모의 연산이므로 단일 뮤텍스로 충분합니다.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

/// 소스별 토큰 버킷
#[derive(Debug, Clone)]
struct TokenBucket {
    /// 현재 보유 토큰 (0.0 ~ max_burst로 클램프)
    tokens: f64,
    /// 마지막 보충 시각. 키별로 단조 비감소.
    last_refill: Instant,
}

/// 토큰 버킷 레이트리미터
///
/// 미지의 소스는 첫 접촉 시 최대 버스트만큼 채워진 버킷으로 시작합니다
/// (초기 버스트 허용).
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    /// 초당 보충 토큰 수
    refill_rate: f64,
    /// 버킷 최대 용량
    max_burst: f64,
    /// 이 시간 이상 유휴인 엔트리는 cleanup에서 제거
    idle_eviction: Duration,
}

impl RateLimiter {
    /// 새 레이트리미터를 생성합니다.
    pub fn new(refill_rate: f64, max_burst: f64, idle_eviction: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            refill_rate,
            max_burst,
            idle_eviction,
        }
    }

    /// 소스의 수신 허용 여부를 판정합니다. 허용 시 토큰 1개를 소비합니다.
    pub fn should_allow(&self, source: &str) -> bool {
        self.should_allow_at(source, Instant::now())
    }

    /// 명시적 시각 기준으로 허용 여부를 판정합니다. 테스트에서 사용합니다.
    pub fn should_allow_at(&self, source: &str, now: Instant) -> bool {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let bucket = buckets
            .entry(source.to_owned())
            .or_insert_with(|| TokenBucket {
                tokens: self.max_burst,
                last_refill: now,
            });

        // 지연 보충: 경과 시간만큼 토큰 추가, 최대 용량으로 클램프
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// 유휴 엔트리를 제거하여 메모리 사용을 제한합니다.
    ///
    /// 백그라운드 스레드에서 주기적으로 호출합니다.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    /// 명시적 시각 기준으로 유휴 엔트리를 제거합니다.
    pub fn cleanup_at(&self, now: Instant) {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            now.saturating_duration_since(bucket.last_refill) < self.idle_eviction
        });
        let evicted = before - buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = buckets.len(), "rate limiter cleanup");
        }
    }

    /// 추적 중인 소스 수를 반환합니다.
    pub fn tracked_sources(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
