//! 방화벽 차단 수명주기 관리
//!
//! 소스별 차단 엔트리를 중복 없이 유지하고, OS 방화벽 규칙의 설치/제거를
//! 수행하며, 백그라운드 워커가 만료된 차단을 주기적으로 해제합니다.
//!
//! 설치된 방화벽 규칙은 종료 시 의도적으로 정리하지 않습니다
//! (재시작 간에 유지됨).

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// 만료 워커 기본 주기
const DEFAULT_SWEEP_TICK: Duration = Duration::from_secs(5);

/// 방화벽 규칙 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallOp {
    /// 패킷 드롭 규칙 설치
    Add,
    /// 규칙 제거
    Remove,
}

/// 호스트 방화벽 어댑터 경계
///
/// 구현체는 소스 식별자에 대한 OS 수준 패킷 드롭 규칙을 설치/제거합니다.
/// 비정상 종료 코드는 경고로만 처리되며 호출자의 상태를 바꾸지 않습니다
/// (존재하지 않는 규칙의 제거는 무해).
pub trait FirewallAdapter: Send + Sync {
    /// 방화벽 규칙을 적용합니다.
    fn apply(&self, source: &str, op: FirewallOp);
}

/// 소스 식별자가 명령 인자로 안전한지 검증합니다.
///
/// 공백 및 셸 특수문자를 포함하면 거부합니다.
pub fn is_safe_source(source: &str) -> bool {
    !source.is_empty()
        && source
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/'))
}

/// iptables 기반 방화벽 어댑터
///
/// `iptables -A INPUT -s <source> -j DROP` / `-D`를 인자 벡터로 실행합니다
/// (셸 경유 없음).
#[derive(Debug, Clone, Default)]
pub struct IptablesFirewall;

impl IptablesFirewall {
    /// 새 어댑터를 생성합니다.
    pub fn new() -> Self {
        Self
    }
}

impl FirewallAdapter for IptablesFirewall {
    fn apply(&self, source: &str, op: FirewallOp) {
        if !is_safe_source(source) {
            tracing::error!(source, "rejected unsafe source in firewall request");
            return;
        }

        let flag = match op {
            FirewallOp::Add => "-A",
            FirewallOp::Remove => "-D",
        };

        match op {
            FirewallOp::Add => {
                tracing::warn!(source, "installing firewall drop rule");
            }
            FirewallOp::Remove => {
                tracing::info!(source, "removing firewall drop rule");
            }
        }

        match Command::new("iptables")
            .args([flag, "INPUT", "-s", source, "-j", "DROP"])
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => {
                // 제거 시 규칙이 이미 없는 경우도 여기로 옴 (무해)
                tracing::warn!(source, ?op, code = status.code(), "firewall command returned non-zero");
            }
            Err(e) => {
                tracing::warn!(source, ?op, error = %e, "failed to execute firewall command");
            }
        }
    }
}

/// 차단 엔트리
#[derive(Debug, Clone)]
struct BlockEntry {
    start: Instant,
    duration: Duration,
}

struct BlockListInner {
    blocks: Mutex<HashMap<String, BlockEntry>>,
    firewall: Box<dyn FirewallAdapter>,
    running: AtomicBool,
}

impl BlockListInner {
    /// 만료된 소스를 수집합니다. 락은 스냅샷 동안만 유지합니다.
    fn collect_expired(&self, now: Instant) -> Vec<String> {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        blocks
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.start) >= entry.duration)
            .map(|(source, _)| source.clone())
            .collect()
    }

    fn unblock(&self, source: &str) {
        {
            let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
            if blocks.remove(source).is_none() {
                return;
            }
        }
        // 부수 효과는 락 밖에서 실행
        self.firewall.apply(source, FirewallOp::Remove);
    }
}

/// 차단 목록 관리자
///
/// 생성 시 만료 워커를 시작하고, drop 시 플래그를 내리고 조인합니다.
pub struct BlockList {
    inner: Arc<BlockListInner>,
    worker: Option<JoinHandle<()>>,
}

impl BlockList {
    /// 기본 5초 만료 주기로 관리자를 생성합니다.
    pub fn new(firewall: Box<dyn FirewallAdapter>) -> Self {
        Self::with_sweep_tick(firewall, DEFAULT_SWEEP_TICK)
    }

    /// 만료 주기를 지정하여 관리자를 생성합니다. 테스트에서 사용합니다.
    pub fn with_sweep_tick(firewall: Box<dyn FirewallAdapter>, tick: Duration) -> Self {
        let inner = Arc::new(BlockListInner {
            blocks: Mutex::new(HashMap::new()),
            firewall,
            running: AtomicBool::new(true),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("vigil-blocklist".to_owned())
            .spawn(move || expiration_worker(&worker_inner, tick))
            .expect("failed to spawn blocklist expiration worker");

        tracing::info!("block list manager started");

        Self {
            inner,
            worker: Some(worker),
        }
    }

    /// 소스를 지정 기간 동안 차단하고 방화벽 규칙을 설치합니다.
    ///
    /// 이미 차단된 소스에 대한 재요청은 기간을 연장하지 않는 no-op입니다
    /// (첫 차단이 우선).
    pub fn block(&self, source: &str, duration: Duration) {
        {
            let mut blocks = self
                .inner
                .blocks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if blocks.contains_key(source) {
                return;
            }
            blocks.insert(
                source.to_owned(),
                BlockEntry {
                    start: Instant::now(),
                    duration,
                },
            );
        }
        self.inner.firewall.apply(source, FirewallOp::Add);
    }

    /// 차단을 해제하고 방화벽 규칙을 제거합니다.
    ///
    /// 차단되지 않은 소스에 대해서는 no-op입니다.
    pub fn unblock(&self, source: &str) {
        self.inner.unblock(source);
    }

    /// 소스가 현재 차단 중인지 확인합니다.
    pub fn is_blocked(&self, source: &str) -> bool {
        self.inner
            .blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(source)
    }

    /// 현재 활성 차단 수를 반환합니다.
    pub fn active_count(&self) -> usize {
        self.inner
            .blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for BlockList {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
    }
}

fn expiration_worker(inner: &BlockListInner, tick: Duration) {
    while inner.running.load(Ordering::Relaxed) {
        std::thread::park_timeout(tick);
        if !inner.running.load(Ordering::Relaxed) {
            break;
        }

        for source in inner.collect_expired(Instant::now()) {
            tracing::info!(source = %source, "ban expired, unblocking");
            inner.unblock(&source);
        }
    }
}
