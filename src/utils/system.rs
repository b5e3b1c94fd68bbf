// src/utils/system.rs: System functions

use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, warn};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::time::sleep;

use crate::config::defs::ResourceLimits;

/// Determines number of cores that can be used for tool invocations
///
/// # Arguments
///
/// * `requested` - `--max-cpus`
///
/// # Returns
///
/// Result<(usize, f32)> usable cores, current cpu usage
pub async fn detect_cores_and_load(requested: usize) -> Result<(usize, f32)> {
    let refresh_kind = RefreshKind::nothing().with_cpu(Default::default());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_all();
    let logical_cores = system.cpus().len().max(System::physical_core_count().unwrap_or(1));
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    sleep(Duration::from_millis(100)).await;
    system.refresh_cpu_specifics(CpuRefreshKind::nothing().with_cpu_usage());
    let cpu_load = system.global_cpu_usage();
    Ok((logical_cores.min(requested).max(1), cpu_load))
}

/// Finds the amount of total and available RAM, keyed to OS
///
/// # Returns
///
/// Result<(u64, u64)> total ram, available ram
pub fn detect_ram() -> Result<(u64, u64)> {
    let (total_ram, available_ram) = if cfg!(target_os = "macos") {
        let refresh_kind = RefreshKind::nothing().with_memory(Default::default());
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_memory_specifics(MemoryRefreshKind::everything());
        let total = system.total_memory();
        let used = system.used_memory();
        (total, total.saturating_sub(used))
    } else {
        let mut system = System::new();
        system.refresh_memory();
        (system.total_memory(), system.available_memory())
    };

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}

/// Clamps the requested ceilings to the host. Detection failures leave the request untouched.
pub async fn clamp_resources(requested: ResourceLimits) -> ResourceLimits {
    let cores = match detect_cores_and_load(requested.max_cpus).await {
        Ok((cores, load)) => {
            debug!("Detected {} usable cores; CPU load {:.1}%", cores, load);
            cores
        }
        Err(e) => {
            warn!("CPU detection failed ({}); using --max-cpus {}", e, requested.max_cpus);
            requested.max_cpus
        }
    };
    let total_ram = match detect_ram() {
        Ok((total, available)) => {
            debug!("Total RAM: {} bytes (~{} GiB)", total, total / 1_073_741_824);
            debug!("Available RAM: {} bytes (~{} GiB)", available, available / 1_073_741_824);
            total
        }
        Err(e) => {
            warn!("RAM detection failed ({}); using --max-memory as given", e);
            0
        }
    };
    let clamped = requested.clamp_to_host(cores, total_ram);
    if clamped.max_cpus < requested.max_cpus {
        warn!("--max-cpus {} exceeds the host; using {}", requested.max_cpus, clamped.max_cpus);
    }
    if clamped.max_memory < requested.max_memory {
        warn!(
            "--max-memory exceeds host RAM; using {} GiB",
            clamped.max_memory / 1_073_741_824
        );
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detect_cores_respects_request() -> Result<()> {
        let (cores, _load) = detect_cores_and_load(1).await?;
        assert_eq!(cores, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_clamp_resources_never_raises_limits() {
        let requested = ResourceLimits {
            max_cpus: 2,
            max_memory: 1_048_576,
            max_time: Duration::from_secs(60),
        };
        let clamped = clamp_resources(requested).await;
        assert!(clamped.max_cpus <= 2 && clamped.max_cpus >= 1);
        assert!(clamped.max_memory <= 1_048_576);
        assert_eq!(clamped.max_time, Duration::from_secs(60));
    }
}
