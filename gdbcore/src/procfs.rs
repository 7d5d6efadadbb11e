/// `/proc` helpers
///
/// Process validity, tracer detection, the trial ptrace attach made before attaching
/// and memory region listing.

use nix::sys::ptrace;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Whether `/proc/<pid>` exists
pub fn process_exists(pid: i32) -> bool {
    pid > 0 && Path::new("/proc").join(pid.to_string()).exists()
}

/// Raw memory file of `pid`
pub fn mem_path(pid: i32) -> PathBuf {
    Path::new("/proc").join(pid.to_string()).join("mem")
}

/// `TracerPid` of `pid`, `None` when the status file is unreadable
pub fn tracer_pid(pid: i32) -> Option<i32> {
    let status = std::fs::read_to_string(Path::new("/proc").join(pid.to_string()).join("status")).ok()?;
    parse_tracer_pid(&status)
}

fn parse_tracer_pid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// Process name from `/proc/<pid>/comm`
pub fn process_name(pid: i32) -> Option<String> {
    std::fs::read_to_string(Path::new("/proc").join(pid.to_string()).join("comm"))
        .ok()
        .map(|name| name.trim_end().to_string())
}

/// Attach and detach once to find out whether we may trace `pid`
pub fn can_ptrace(pid: i32) -> bool {
    let pid = Pid::from_raw(pid);
    if let Err(e) = ptrace::attach(pid) {
        log::debug!("trial ptrace attach to {} failed: {}", pid, e);
        return false;
    }
    if let Err(e) = waitpid(pid, None) {
        log::warn!("waitpid after trial ptrace attach to {} failed: {}", pid, e);
    }
    if let Err(e) = ptrace::detach(pid, None) {
        log::warn!("ptrace detach after trial attach to {} failed: {}", pid, e);
    }
    true
}

/// One mapping of the inferior's address space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    /// `rwx` style permission triple
    pub perms: String,
    pub path: Option<PathBuf>,
}

impl MemoryRegion {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end).contains(&address)
    }

    pub fn is_readable(&self) -> bool {
        self.perms.starts_with('r')
    }

    /// Path for filtering; anonymous regions are the empty string
    pub fn path_str(&self) -> String {
        self.path
            .as_deref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Current mappings of `pid`
pub fn regions(pid: i32) -> io::Result<Vec<MemoryRegion>> {
    let maps = proc_maps::get_process_maps(pid)?;
    Ok(maps
        .iter()
        .map(|map| {
            let mut perms = String::with_capacity(3);
            perms.push(if map.is_read() { 'r' } else { '-' });
            perms.push(if map.is_write() { 'w' } else { '-' });
            perms.push(if map.is_exec() { 'x' } else { '-' });
            MemoryRegion {
                start: map.start() as u64,
                end: (map.start() + map.size()) as u64,
                perms,
                path: map.filename().map(Path::to_path_buf),
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionAttribute {
    Perms,
    Path,
}

/// Regions whose `attribute` matches `pattern`
pub fn filter_regions(
    regions: &[MemoryRegion],
    attribute: RegionAttribute,
    pattern: &str,
    case_sensitive: bool,
) -> Result<Vec<MemoryRegion>, regex::Error> {
    let pattern = RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()?;
    Ok(regions
        .iter()
        .filter(|region| match attribute {
            RegionAttribute::Perms => pattern.is_match(&region.perms),
            RegionAttribute::Path => pattern.is_match(&region.path_str()),
        })
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tracer_pid() {
        let status = "Name:\tcat\nState:\tR (running)\nTracerPid:\t1234\nUid:\t0\n";
        assert_eq!(parse_tracer_pid(status), Some(1234));
        assert_eq!(parse_tracer_pid("Name:\tcat\n"), None);
    }

    #[test]
    fn test_own_process_is_visible() {
        let pid = std::process::id() as i32;
        assert!(process_exists(pid));
        assert!(!process_exists(-1));
        assert!(tracer_pid(pid).is_some());
        assert!(regions(pid).unwrap().iter().any(|r| r.is_readable()));
    }

    #[test]
    fn test_filter_regions() {
        let regions = vec![
            MemoryRegion {
                start: 0x400000,
                end: 0x401000,
                perms: "r-x".into(),
                path: Some(PathBuf::from("/usr/bin/Game")),
            },
            MemoryRegion {
                start: 0x7000,
                end: 0x8000,
                perms: "rw-".into(),
                path: None,
            },
        ];
        let code = filter_regions(&regions, RegionAttribute::Perms, "x", true).unwrap();
        assert_eq!(code.len(), 1);
        let game = filter_regions(&regions, RegionAttribute::Path, "game$", false).unwrap();
        assert_eq!(game[0].start, 0x400000);
        assert!(filter_regions(&regions, RegionAttribute::Path, "game$", true)
            .unwrap()
            .is_empty());
    }
}
