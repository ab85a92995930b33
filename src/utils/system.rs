// src/utils/system.rs: System functions

use std::time::Duration;

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Samples the physical core count and current CPU load.
///
/// # Returns
///
/// (physical cores, global cpu usage in percent)
pub async fn detect_cores_and_load() -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let physical_cores = System::physical_core_count().unwrap_or(1);
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    let cpu_load = system.global_cpu_usage();
    (physical_cores, cpu_load)
}


/// Worker count handed to multi-process jobs: the requested value, else the
/// physical core count.
///
/// # Arguments
///
/// * `requested` - `--workers` if given.
/// * `physical_cores` - From detect_cores_and_load.
pub fn resolve_workers(requested: Option<usize>, physical_cores: usize) -> usize {
    requested.unwrap_or(physical_cores).max(1)
}
