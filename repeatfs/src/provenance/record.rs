//! Provenance record types and operation-kind flags, mirroring
//! `provenance/management.py`'s `OP_*` constants, `file_record.py`,
//! `process_record.py`, and `io_record.py`.

use bitflags::bitflags;

bitflags! {
    /// The kinds of filesystem operation a read/write provenance row can
    /// represent, matching `Management.OP_IO` through `OP_TRUNCATE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpKind: u32 {
        const IO       = 1 << 0;
        const ACCESS   = 1 << 1;
        const CHMOD    = 1 << 2;
        const CHOWN    = 1 << 3;
        const ATTR     = 1 << 4;
        const GETDIR   = 1 << 5;
        const GETLINK  = 1 << 6;
        const MKNOD    = 1 << 7;
        const RMDIR    = 1 << 8;
        const MKDIR    = 1 << 9;
        const STATS    = 1 << 10;
        const UNLINK   = 1 << 11;
        const MKSYM    = 1 << 12;
        const MKHARD   = 1 << 13;
        const MOVE     = 1 << 14;
        const TIME     = 1 << 15;
        const CD       = 1 << 16;
        const TRUNCATE = 1 << 17;
    }
}

/// One row of the `process` table: everything known about a live or
/// recently-live process (`ProcessRecord`).
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub pstart: f64,
    pub parent_pid: u32,
    pub parent_start: f64,
    pub cmd: String,
    pub exe: String,
    pub hash: String,
    pub cwd: String,
    pub tgid: u32,
    pub tgid_start: f64,
    pub session_id: u32,
    pub session_start: f64,
    pub env: String,
    pub stdio: [String; 3],
    pub stdio_trunc: [bool; 3],
    pub dirty: bool,
}

/// One row of the `file`/`file_last` tables: a real path and the logical
/// "version" (creation timestamp) an IO record is scoped to (`FileRecord`).
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: String,
    pub fcreate: f64,
    pub file_type: String,
}

/// Read or write direction for an [`IoRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// One row of the `read`/`write` tables: the open span and accumulated
/// operation flags for one (process, file-version) pair (`IORecord`).
#[derive(Debug, Clone, Default)]
pub struct IoRecord {
    pub read_start: Option<f64>,
    pub read_end: Option<f64>,
    pub read_ops: OpKind,
    pub write_start: Option<f64>,
    pub write_end: Option<f64>,
    pub write_ops: OpKind,
}

impl IoRecord {
    /// Record one IO event, opening the span's start time if this is the
    /// first operation seen for that direction (`IORecord.update`).
    pub fn update(&mut self, direction: IoDirection, op_type: OpKind, at: f64) {
        match direction {
            IoDirection::Read => {
                if self.read_start.is_none() {
                    self.read_start = Some(at);
                }
                self.read_end = Some(at);
                self.read_ops |= op_type;
            }
            IoDirection::Write => {
                if self.write_start.is_none() {
                    self.write_start = Some(at);
                }
                self.write_end = Some(at);
                self.write_ops |= op_type;
            }
        }
    }
}
