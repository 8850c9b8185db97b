//! Host process snapshot abstraction, reading the same `/proc` fields
//! `provenance/process_record.py`'s `get_stat_info`/`_update` do.

use std::fs;
use std::io::Read;

use crate::error::{Error, Result};

/// Hash a file's contents with MD5, matching `Management._calculate_hash`'s
/// streamed-chunk read. Empty string if the file can't be opened or read.
fn hash_file(path: &str) -> String {
    use md5::{Digest, Md5};

    let mut handle = match fs::File::open(path) {
        Ok(handle) => handle,
        Err(_) => return String::new(),
    };

    let mut hasher = Md5::new();
    let mut buf = [0u8; 4096];
    loop {
        match handle.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(_) => return String::new(),
        }
    }

    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A point-in-time read of one process's `/proc` state.
#[derive(Debug, Clone, Default)]
pub struct ProcessStat {
    /// Monotonic start time, in seconds since epoch (`pstart`).
    pub start: f64,
    /// Parent PID, or 0 if this is PID 1.
    pub parent_pid: u32,
    /// POSIX session ID.
    pub session_id: u32,
    /// Thread group leader ID.
    pub tgid: u32,
}

/// Everything a [`ProcessRecord`](super::record::ProcessRecord) needs about
/// one live process, abstracted so tests can supply a fake without a real
/// `/proc`.
pub trait ProcessSnapshot: Send + Sync {
    /// Basic `/proc/<pid>/stat` fields (`ProcessRecord.get_stat_info`).
    fn stat(&self, pid: u32) -> Result<ProcessStat>;
    /// `Tgid:` field from `/proc/<pid>/status`.
    fn tgid(&self, pid: u32) -> Result<u32>;
    /// Target of `/proc/<pid>/exe`, empty string if unreadable or `pid <= 1`.
    fn exe(&self, pid: u32) -> String;
    /// MD5 of the executable at `exe`'s contents, empty if it can't be read
    /// (`Management._calculate_hash`, called on `self.exe`). Provided as a
    /// default since hashing an already-resolved path needs nothing
    /// process-specific; override for tests that want a fixed value.
    fn exe_hash(&self, exe: &str) -> String {
        if exe.is_empty() {
            return String::new();
        }
        hash_file(exe)
    }
    /// Target of `/proc/<pid>/cwd`, empty string if unreadable or `pid <= 1`.
    fn cwd(&self, pid: u32) -> String;
    /// `/proc/<pid>/cmdline`, NUL-joined arguments collapsed the way the
    /// original drops the trailing NUL before storing it as one blob.
    fn cmdline(&self, pid: u32) -> String;
    /// Target of `/proc/<pid>/fd/<fd>`, empty string if unreadable.
    fn fd_target(&self, pid: u32, fd: u32) -> String;
    /// All currently live PIDs under `/proc`, for pipe-peer discovery.
    fn all_pids(&self) -> Vec<u32>;
    /// System boot time, in seconds since epoch (`Management._get_boot`).
    fn boot_time(&self) -> Result<f64>;
    /// `SC_CLK_TCK`, clock ticks per second (`Management.hz`).
    fn clock_ticks_per_sec(&self) -> i64;
}

/// The real, Linux `/proc`-backed [`ProcessSnapshot`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxProcfs;

impl LinuxProcfs {
    fn stat_fields(pid: u32) -> Result<Vec<String>> {
        let raw = fs::read_to_string(format!("/proc/{pid}/stat"))
            .map_err(|_| Error::NotFound(format!("process {pid} not found")))?;
        Ok(raw.trim_end().split(' ').map(str::to_string).collect())
    }

    /// `/proc/<pid>/stat`'s process-name field may itself contain spaces or
    /// parentheses; locate where it ends so the positional fields after it
    /// line up, matching the original's `field_mod` scan.
    fn field_mod(fields: &[String]) -> usize {
        for (idx, field) in fields.iter().enumerate().skip(1) {
            if field.ends_with(')') {
                return idx - 1;
            }
        }
        0
    }
}

impl ProcessSnapshot for LinuxProcfs {
    fn stat(&self, pid: u32) -> Result<ProcessStat> {
        let fields = Self::stat_fields(pid)?;
        let field_mod = Self::field_mod(&fields);

        let hz = self.clock_ticks_per_sec();
        let boot = self.boot_time()?;

        let start_ticks: i64 = fields
            .get(21 + field_mod)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Invalid(format!("malformed /proc/{pid}/stat")))?;

        let start = ((boot + start_ticks as f64 / hz as f64) * 1000.0).round() / 1000.0;

        let parent_pid = fields.get(3 + field_mod).and_then(|s| s.parse().ok()).unwrap_or(0);
        let session_id = fields.get(5 + field_mod).and_then(|s| s.parse().ok()).unwrap_or(0);

        Ok(ProcessStat {
            start,
            parent_pid,
            session_id,
            tgid: 0,
        })
    }

    fn tgid(&self, pid: u32) -> Result<u32> {
        let status = fs::read_to_string(format!("/proc/{pid}/status"))
            .map_err(|_| Error::NotFound(format!("process {pid} not found")))?;

        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("Tgid:") {
                return rest
                    .trim()
                    .parse()
                    .map_err(|_| Error::Invalid(format!("malformed Tgid for {pid}")));
            }
        }

        Err(Error::Invalid(format!("no Tgid field for {pid}")))
    }

    fn exe(&self, pid: u32) -> String {
        if pid <= 1 {
            return String::new();
        }
        fs::read_link(format!("/proc/{pid}/exe"))
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn cwd(&self, pid: u32) -> String {
        if pid <= 1 {
            return String::new();
        }
        fs::read_link(format!("/proc/{pid}/cwd"))
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn cmdline(&self, pid: u32) -> String {
        fs::read_to_string(format!("/proc/{pid}/cmdline"))
            .map(|raw| raw.trim_end_matches('\0').replace('\0', " "))
            .unwrap_or_default()
    }

    fn fd_target(&self, pid: u32, fd: u32) -> String {
        fs::read_link(format!("/proc/{pid}/fd/{fd}"))
            .map(|p| p.to_string_lossy().replace(" (deleted)", ""))
            .unwrap_or_default()
    }

    fn all_pids(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        if let Ok(entries) = fs::read_dir("/proc") {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(pid) = name.parse() {
                        pids.push(pid);
                    }
                }
            }
        }
        pids
    }

    fn boot_time(&self) -> Result<f64> {
        let stat = fs::read_to_string("/proc/stat").map_err(Error::IoError)?;
        for line in stat.lines() {
            if let Some(rest) = line.strip_prefix("btime ") {
                return rest.trim().parse().map_err(|_| Error::Invalid("malformed btime".to_string()));
            }
        }
        Err(Error::Invalid("no btime in /proc/stat".to_string()))
    }

    fn clock_ticks_per_sec(&self) -> i64 {
        // SC_CLK_TCK is the POSIX-mandated constant on Linux; sysconf is
        // only used for platforms where it can legitimately vary.
        unsafe { libc::sysconf(libc::_SC_CLK_TCK) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_own_process_stat() {
        let snapshot = LinuxProcfs;
        let pid = std::process::id();
        let stat = snapshot.stat(pid).unwrap();
        assert!(stat.start > 0.0);
    }

    #[test]
    fn boot_time_is_positive() {
        let snapshot = LinuxProcfs;
        assert!(snapshot.boot_time().unwrap() > 0.0);
    }

    #[test]
    fn exe_hash_matches_known_md5_and_is_empty_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bin");
        fs::write(&path, b"hello").unwrap();

        let snapshot = LinuxProcfs;
        assert_eq!(snapshot.exe_hash(path.to_str().unwrap()), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(snapshot.exe_hash(""), "");
        assert_eq!(snapshot.exe_hash(dir.path().join("missing").to_str().unwrap()), "");
    }
}
