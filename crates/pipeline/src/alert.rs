//! 알림 매니저 — 쿨다운 기반 중복 억제 및 능동 대응 디스패치
//!
//! 치명적 판정을 받아 소스별 쿨다운을 적용한 뒤, pub/sub 발행과
//! (활성화된 경우) 방화벽 차단을 디스패치합니다. 쿨다운 맵은 단일
//! 뮤텍스로 보호되며, 디스패치는 락 밖에서 수행됩니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use vigil_core::types::AlertRecord;

use crate::blocklist::BlockList;
use crate::publish::AlertSink;
use crate::stats::PipelineStats;

/// 알림 매니저
///
/// 오케스트레이터가 생성하여 처리 스레드에 주입합니다. 동일 소스에 대한
/// 알림은 쿨다운 윈도우 내에서 한 번만 부수 효과를 발생시킵니다.
pub struct AlertManager {
    /// 소스 -> 마지막 알림 시각
    cooldowns: Mutex<HashMap<String, Instant>>,
    cooldown_window: Duration,
    critical_threshold: f32,
    ban_duration: Duration,
    active_defense: bool,
    publisher: Arc<dyn AlertSink>,
    blocklist: Arc<BlockList>,
    stats: Arc<PipelineStats>,
}

impl AlertManager {
    /// 새 알림 매니저를 생성합니다.
    pub fn new(
        cooldown_window: Duration,
        critical_threshold: f32,
        ban_duration: Duration,
        active_defense: bool,
        publisher: Arc<dyn AlertSink>,
        blocklist: Arc<BlockList>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            cooldowns: Mutex::new(HashMap::new()),
            cooldown_window,
            critical_threshold,
            ban_duration,
            active_defense,
            publisher,
            blocklist,
            stats,
        }
    }

    /// 판정을 평가하고 필요 시 부수 효과를 디스패치합니다.
    pub fn trigger(&self, source: &str, score: f32, reason: &str) {
        self.trigger_at(source, score, reason, Instant::now());
    }

    /// 명시적 시각 기준으로 트리거합니다. 테스트에서 사용합니다.
    pub fn trigger_at(&self, source: &str, score: f32, reason: &str, now: Instant) {
        if score < self.critical_threshold {
            return;
        }

        // 쿨다운 검사 및 갱신. 디스패치는 락 해제 후 수행.
        {
            let mut cooldowns = self
                .cooldowns
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = cooldowns.get(source)
                && now.saturating_duration_since(*last) < self.cooldown_window
            {
                tracing::debug!(source, "alert suppressed by cooldown");
                return;
            }
            cooldowns.insert(source.to_owned(), now);
        }

        tracing::warn!(source, score, reason, "critical threat detected");

        let record = AlertRecord {
            source: source.to_owned(),
            score,
            reason: reason.to_owned(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        if !self.publisher.publish(&record) {
            self.stats.inc_publish_errors(1);
        }

        if self.active_defense {
            self.blocklist.block(source, self.ban_duration);
        }
    }

    /// 쿨다운 윈도우를 벗어난 엔트리를 제거하여 메모리 성장을 방지합니다.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    /// 명시적 시각 기준으로 만료 엔트리를 제거합니다.
    pub fn cleanup_at(&self, now: Instant) {
        self.cooldowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, last| now.saturating_duration_since(*last) < self.cooldown_window);
    }

    /// 추적 중인 쿨다운 엔트리 수를 반환합니다.
    pub fn tracked_sources(&self) -> usize {
        self.cooldowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
