//! Adaptive memory policy.
//!
//! Decides when large auxiliary structures (inode-map hash, extent
//! hash, big bitmaps) should spill to a workdir-backed file or be
//! dropped in favor of linear scans. The policy is built once by the
//! driver and passed to the components that consult it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};

const TMPFS_FALLBACK_TOTAL: u64 = 2 * 1024 * 1024 * 1024;

pub struct MemoryPolicy {
    pub total_ram: u64,
    pub available_ram: u64,
    /// Structures at or past this size go to a mapped temp file.
    pub mmap_threshold: u64,
    pub workdir: PathBuf,
    pub workdir_is_tmpfs: bool,
    tracked: AtomicU64,
}

impl MemoryPolicy {
    /// Detect RAM from /proc/meminfo and resolve the threshold:
    /// `memory_limit` bytes when given, otherwise 60% of physical RAM.
    pub fn detect(workdir: &Path, memory_limit: u64) -> MemoryPolicy {
        let (total_ram, available_ram) = read_meminfo();
        let mmap_threshold = if memory_limit > 0 {
            memory_limit
        } else {
            total_ram * 60 / 100
        };

        let workdir_is_tmpfs = is_tmpfs(workdir);
        if workdir_is_tmpfs {
            warn!(
                "workdir {} is on tmpfs (RAM-backed); temp spill files there \
                 defeat the purpose of mmap, use a physical disk path",
                workdir.display()
            );
        }

        info!(
            "memory policy: {:.1} GiB total, {:.1} GiB available, mmap threshold {:.0} MiB{}",
            total_ram as f64 / (1024.0 * 1024.0 * 1024.0),
            available_ram as f64 / (1024.0 * 1024.0 * 1024.0),
            mmap_threshold as f64 / (1024.0 * 1024.0),
            if memory_limit > 0 { " (user)" } else { " (auto 60%)" }
        );

        MemoryPolicy {
            total_ram,
            available_ram,
            mmap_threshold,
            workdir: workdir.to_path_buf(),
            workdir_is_tmpfs,
            tracked: AtomicU64::new(0),
        }
    }

    /// Fixed-threshold policy for tests.
    pub fn fixed(workdir: &Path, mmap_threshold: u64) -> MemoryPolicy {
        MemoryPolicy {
            total_ram: TMPFS_FALLBACK_TOTAL,
            available_ram: TMPFS_FALLBACK_TOTAL / 2,
            mmap_threshold,
            workdir: workdir.to_path_buf(),
            workdir_is_tmpfs: false,
            tracked: AtomicU64::new(0),
        }
    }

    /// Should a structure of this size be mapped instead of heap-held?
    pub fn should_spill(&self, bytes: u64) -> bool {
        bytes >= self.mmap_threshold
    }

    /// Would adding this allocation push tracked usage past 75% of
    /// available RAM? Callers drop the optional structure when so.
    pub fn would_exceed(&self, bytes: u64) -> bool {
        let current = self.tracked.load(Ordering::Relaxed);
        current.saturating_add(bytes) > self.available_ram / 4 * 3
    }

    pub fn note_alloc(&self, bytes: u64) {
        self.tracked.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn note_free(&self, bytes: u64) {
        let _ = self
            .tracked
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn tracked_bytes(&self) -> u64 {
        self.tracked.load(Ordering::Relaxed)
    }
}

fn read_meminfo() -> (u64, u64) {
    let Ok(text) = fs::read_to_string("/proc/meminfo") else {
        return (16 * 1024 * 1024 * 1024, 8 * 1024 * 1024 * 1024);
    };
    let mut total = 0u64;
    let mut available = 0u64;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kib(rest);
        }
    }
    if total == 0 {
        total = 8 * 1024 * 1024 * 1024;
    }
    if available == 0 {
        available = total / 2;
    }
    (total, available)
}

fn parse_kib(rest: &str) -> u64 {
    rest.trim()
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

fn is_tmpfs(path: &Path) -> bool {
    match nix::sys::statfs::statfs(path) {
        Ok(stat) => stat.filesystem_type() == nix::sys::statfs::TMPFS_MAGIC,
        Err(_) => false,
    }
}
