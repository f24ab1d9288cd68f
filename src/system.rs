use sysinfo::{ProcessesToUpdate, System};

use crate::models::SystemMetrics;

/// Resident memory of this process. The relay owns no GPU allocation, so
/// `gpu_memory` is always `None`.
pub fn snapshot() -> SystemMetrics {
    SystemMetrics {
        memory: resident_memory_bytes().map(format_megabytes),
        gpu_memory: None,
    }
}

fn format_megabytes(bytes: u64) -> String {
    format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
}

fn resident_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|process| process.memory())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_megabytes_with_one_decimal() {
        assert_eq!(format_megabytes(10240 * 1024), "10.0MB");
        assert_eq!(format_megabytes(1536 * 1024), "1.5MB");
    }

    #[test]
    fn snapshot_reports_own_memory_and_no_gpu() {
        let metrics = snapshot();

        let memory = metrics.memory.expect("own process should be visible");
        assert!(memory.ends_with("MB"));
        assert!(memory.trim_end_matches("MB").parse::<f64>().expect("numeric") > 0.0);
        assert_eq!(metrics.gpu_memory, None);
    }
}
