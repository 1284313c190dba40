// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background resource monitor for a running transformation order.
//!
//! Samples CPU time, RAM, and processing-directory disk usage on an
//! interval for the lifetime of a job runner pipeline run, then reports
//! peak values once stopped. Runs as a tokio background task sampling
//! via `sysinfo`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Peak/aggregate resource usage observed over a monitored run.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct ResourceUsage {
    /// Wall-clock duration of the monitored run, in seconds.
    pub processing_time_secs: f64,
    /// Peak resident memory observed, in bytes.
    pub peak_ram_bytes: u64,
    /// Peak processing-directory size observed, in bytes.
    pub peak_disk_bytes: u64,
    /// Total CPU time consumed by the monitored process, in seconds.
    pub cpu_time_secs: f64,
}

fn directory_size(dir: &std::path::Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// A running resource monitor; call [`ResourceMonitor::stop`] to end
/// sampling and collect the final [`ResourceUsage`].
pub struct ResourceMonitor {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<ResourceUsage>,
}

impl ResourceMonitor {
    /// Start sampling `pid`'s CPU/RAM and `processing_dir`'s disk usage
    /// every `poll_interval`, in a background tokio task.
    pub fn start(pid: u32, processing_dir: PathBuf, poll_interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let sysinfo_pid = Pid::from_u32(pid);
            let mut system = System::new();

            let mut usage = ResourceUsage::default();
            let mut ticker = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        system.refresh_processes_specifics(
                            sysinfo::ProcessesToUpdate::Some(&[sysinfo_pid]),
                            true,
                            ProcessRefreshKind::everything(),
                        );
                        if let Some(process) = system.process(sysinfo_pid) {
                            usage.peak_ram_bytes = usage.peak_ram_bytes.max(process.memory());
                            usage.cpu_time_secs = usage.cpu_time_secs
                                .max(process.run_time() as f64);
                        }
                        let disk_bytes = directory_size(&processing_dir);
                        usage.peak_disk_bytes = usage.peak_disk_bytes.max(disk_bytes);
                        debug!(
                            peak_ram_bytes = usage.peak_ram_bytes,
                            peak_disk_bytes = usage.peak_disk_bytes,
                            "resource monitor sample"
                        );
                    }
                    _ = &mut stop_rx => {
                        break;
                    }
                }
            }

            usage.processing_time_secs = started.elapsed().as_secs_f64();
            usage
        });

        Self { stop_tx, handle }
    }

    /// Signal the sampling loop to stop and await its final
    /// [`ResourceUsage`] snapshot.
    pub async fn stop(self) -> ResourceUsage {
        let _ = self.stop_tx.send(());
        self.handle.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_size_sums_file_lengths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("b.bin"), vec![0u8; 250]).unwrap();
        assert_eq!(directory_size(dir.path()), 350);
    }

    #[tokio::test]
    async fn monitor_reports_elapsed_processing_time() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::start(
            std::process::id(),
            dir.path().to_path_buf(),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        let usage = monitor.stop().await;
        assert!(usage.processing_time_secs > 0.0);
    }

    #[tokio::test]
    async fn monitor_tracks_peak_disk_usage_growth() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::start(
            std::process::id(),
            dir.path().to_path_buf(),
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(15)).await;
        std::fs::write(dir.path().join("grew.bin"), vec![0u8; 1024]).unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        let usage = monitor.stop().await;
        assert!(usage.peak_disk_bytes >= 1024);
    }
}
