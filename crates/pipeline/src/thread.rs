//! 스레드 튜닝 유틸리티 — CPU 피닝 및 실시간 스케줄링
//!
//! 데이터 플레인 스레드의 테일 레이턴시 제어를 위해 코어 피닝과
//! SCHED_FIFO 우선순위를 설정합니다. 두 작업 모두 best-effort이며,
//! 실패는 경고 로그만 남기고 치명적이지 않습니다 (권한/코어 수 부족 등).

/// 현재 스레드를 지정한 코어에 피닝합니다.
///
/// 코어 ID가 시스템 코어 수를 벗어나거나 syscall이 실패하면 false를
/// 반환합니다.
#[cfg(target_os = "linux")]
pub fn pin_current_thread_to_core(core_id: usize) -> bool {
    let num_cores = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    if core_id >= num_cores {
        tracing::warn!(core_id, num_cores, "invalid core id, skipping thread pin");
        return false;
    }

    // SAFETY: cpu_set_t는 POD이며 CPU_ZERO/CPU_SET은 로컬 버퍼만 변경합니다.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(core_id, &mut cpuset);

        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset);
        if rc != 0 {
            tracing::warn!(
                core_id,
                errno = std::io::Error::last_os_error().raw_os_error(),
                "failed to pin thread to core"
            );
            return false;
        }
    }

    tracing::info!(core_id, "thread pinned to core");
    true
}

/// 현재 스레드에 SCHED_FIFO 실시간 우선순위를 설정합니다.
///
/// CAP_SYS_NICE가 없으면 실패합니다. 실패는 경고만 남깁니다.
#[cfg(target_os = "linux")]
pub fn set_realtime_priority(priority: i32) -> bool {
    // SAFETY: sched_param은 POD이며 syscall은 현재 스레드에만 적용됩니다.
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
        if rc != 0 {
            tracing::warn!(
                priority,
                errno = std::io::Error::last_os_error().raw_os_error(),
                "failed to set realtime priority (requires CAP_SYS_NICE)"
            );
            return false;
        }
    }

    tracing::info!(priority, "realtime FIFO priority set");
    true
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread_to_core(core_id: usize) -> bool {
    tracing::warn!(core_id, "thread pinning unsupported on this platform");
    false
}

#[cfg(not(target_os = "linux"))]
pub fn set_realtime_priority(priority: i32) -> bool {
    tracing::warn!(priority, "realtime scheduling unsupported on this platform");
    false
}
