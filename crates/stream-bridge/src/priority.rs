//! Realtime scheduling for the playback thread.

/// Put the calling thread under `SCHED_FIFO` at `priority` (1..=99).
///
/// Failure (usually a missing `rtprio` limit or `CAP_SYS_NICE`) is logged and
/// playback continues at normal priority. Returns whether the change took effect.
#[cfg(target_os = "linux")]
pub fn elevate(priority: u8) -> bool {
    let priority = i32::from(priority.clamp(1, 99));
    // SAFETY: `sched_param` is plain data; zeroed is a valid value and the call
    // only reads it.
    let result = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if result == 0 {
        tracing::info!(priority, "realtime priority enabled (SCHED_FIFO)");
        true
    } else {
        tracing::warn!(
            priority,
            error = %std::io::Error::from_raw_os_error(result),
            "failed to set realtime priority; continuing at normal priority"
        );
        false
    }
}

#[cfg(not(target_os = "linux"))]
pub fn elevate(priority: u8) -> bool {
    tracing::warn!(priority, "realtime priority not supported on this platform");
    false
}
