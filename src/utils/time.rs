use std::time::Duration;

/// Human readable rendering of a delay for log lines, e.g. `1s 500ms`.
pub fn format_delay(delay: Duration) -> String {
    // sub-millisecond precision is noise in logs
    let millis = Duration::from_millis(delay.as_millis() as u64);
    humantime::format_duration(millis).to_string()
}
