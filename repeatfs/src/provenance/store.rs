//! Embedded provenance store, mirroring `provenance/management.py`,
//! `file_record.py`, and `io_record.py`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::descriptor::{Descriptor, DescriptorId, DescriptorTable};
use crate::error::Result;
use crate::identity::{FileIdentity, Kind, OrigType, Paths};

use super::record::{FileRecord, IoDirection, IoRecord, OpKind, ProcessRecord};
use super::snapshot::ProcessSnapshot;

fn now() -> f64 {
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (dur.as_secs_f64() * 1000.0).round() / 1000.0
}

struct State {
    process_lookup: HashMap<u32, ProcessRecord>,
    file_lookup: HashMap<DescriptorId, FileRecord>,
    file_last_cache: HashMap<String, f64>,
    file_dirty_cache: std::collections::HashSet<(String, i64)>,
    io_lookup: HashMap<DescriptorId, HashMap<u32, IoRecord>>,
}

/// Owns the embedded SQLite connection and the in-memory caches that sit in
/// front of it, mirroring `Management`'s class-level lookup dicts.
pub struct Store {
    conn: Mutex<Connection>,
    state: Mutex<State>,
    system_name: String,
    mid: i64,
    root: String,
    mount: String,
    snapshot: Arc<dyn ProcessSnapshot>,
    /// Private pseudo-descriptor namespace for shared pipe endpoints, kept
    /// separate from the real open-file descriptor table since pipe rows
    /// never carry a FUSE file handle (`DescriptorEntry.gen_pipe`'s own
    /// `_pipe_lookup`).
    pipe_descriptors: DescriptorTable,
}

const SCHEMA: &[(&str, &str)] = &[
    (
        "mount",
        "mid INTEGER, root TEXT, mount TEXT, PRIMARY KEY (mid)",
    ),
    (
        "file",
        "path TEXT, fcreate INT, type TEXT, PRIMARY KEY (path, fcreate)",
    ),
    ("file_last", "path TEXT, fcreate INT, PRIMARY KEY (path)"),
    (
        "process",
        "phost TEXT, pstart INT, pid INT, parent_start INT, parent_pid INT, cmd BLOB, exe TEXT, \
         hash TEXT, cwd TEXT, tgid_start INT, tgid INT, session_start INT, session_id INT, env TEXT, \
         stdin TEXT, stdout TEXT, stderr TEXT, trunc_stdout INT, trunc_stderr INT, mid INT, \
         PRIMARY KEY (phost, pstart, pid)",
    ),
    (
        "read",
        "phost TEXT, pstart INT, pid INT, path TEXT, fcreate INT, start INT, stop INT, ops INT, \
         PRIMARY KEY (phost, pstart, pid, path, fcreate)",
    ),
    (
        "write",
        "phost TEXT, pstart INT, pid INT, path TEXT, fcreate INT, start INT, stop INT, ops INT, \
         PRIMARY KEY (phost, pstart, pid, path, fcreate)",
    ),
];

impl Store {
    /// Open (creating if necessary) `<config_dir>/provenance.db`, run schema
    /// DDL, and register the current (root, mount) pair (`Management.__init__`,
    /// `_init_db`, `_write_root`).
    pub fn open(config_dir: &Path, root: &Path, mount: &Path, snapshot: Arc<dyn ProcessSnapshot>) -> Result<Self> {
        let db_path = config_dir.join("provenance.db");
        let conn = Connection::open(db_path)?;

        conn.execute_batch("PRAGMA synchronous = OFF;")?;
        for (table, ddl) in SCHEMA {
            conn.execute(&format!("CREATE TABLE IF NOT EXISTS {table} ({ddl})"), [])?;
        }
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS mount_rootmount ON mount(root, mount)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS process_parent ON process(phost, parent_start, parent_pid)",
            [],
        )?;

        let root_str = root.to_string_lossy().to_string();
        let mount_str = mount.to_string_lossy().to_string();

        conn.execute(
            "INSERT OR IGNORE INTO mount (mid, root, mount) VALUES (NULL, ?1, ?2)",
            params![root_str, mount_str],
        )?;
        let mid: i64 = conn.query_row(
            "SELECT mid FROM mount WHERE root = ?1 AND mount = ?2",
            params![root_str, mount_str],
            |row| row.get(0),
        )?;

        let system_name = hostname();

        Ok(Store {
            conn: Mutex::new(conn),
            state: Mutex::new(State {
                process_lookup: HashMap::new(),
                file_lookup: HashMap::new(),
                file_last_cache: HashMap::new(),
                file_dirty_cache: std::collections::HashSet::new(),
                io_lookup: HashMap::new(),
            }),
            system_name,
            mid,
            root: root_str,
            mount: mount_str,
            snapshot,
            pipe_descriptors: DescriptorTable::new(),
        })
    }

    /// The real backing root this store was opened against, used by graph
    /// finalization to compute the mount-relative rewrite.
    pub fn root_str(&self) -> &str {
        &self.root
    }

    /// The mount path this store was opened against.
    pub fn mount_str(&self) -> &str {
        &self.mount
    }

    fn get_or_update_process(&self, state: &mut State, pid: u32) -> Result<ProcessRecord> {
        if let Some(existing) = state.process_lookup.get(&pid) {
            return Ok(existing.clone());
        }

        let record = self.build_process_record(pid)?;
        state.process_lookup.insert(pid, record.clone());
        Ok(record)
    }

    fn build_process_record(&self, pid: u32) -> Result<ProcessRecord> {
        self.build_process_record_inner(pid, true)
    }

    /// `scan_pipes` is `false` for the one-hop peer lookup in
    /// [`Self::record_pipes`], so discovering a peer never recurses into that
    /// peer's own stdio scan.
    fn build_process_record_inner(&self, pid: u32, scan_pipes: bool) -> Result<ProcessRecord> {
        let stat = self.snapshot.stat(pid)?;
        let tgid = self.snapshot.tgid(pid).unwrap_or(0);

        let parent_start = if stat.parent_pid > 0 {
            self.snapshot.stat(stat.parent_pid).map(|s| s.start).unwrap_or(0.0)
        } else {
            0.0
        };
        let tgid_start = if tgid > 0 {
            self.snapshot.stat(tgid).map(|s| s.start).unwrap_or(0.0)
        } else {
            0.0
        };
        let session_start = if stat.session_id > 0 {
            self.snapshot.stat(stat.session_id).map(|s| s.start).unwrap_or(0.0)
        } else {
            0.0
        };

        let exe = self.snapshot.exe(pid);
        let cwd = self.snapshot.cwd(pid);
        let cmd = self.snapshot.cmdline(pid);
        let hash = self.snapshot.exe_hash(&exe);

        let stdio = [
            self.snapshot.fd_target(pid, 0),
            self.snapshot.fd_target(pid, 1),
            self.snapshot.fd_target(pid, 2),
        ];

        if let Some(abs_real) = self.cwd_dependency_path(&cwd) {
            if let Err(err) = self.register_cwd_read(&abs_real, pid, stat.start) {
                log::warn!("provenance CWD tracking failed for pid {pid}: {err}");
            }
        }

        let record = ProcessRecord {
            pid,
            pstart: stat.start,
            parent_pid: stat.parent_pid,
            parent_start,
            cmd,
            exe,
            hash,
            cwd,
            tgid,
            tgid_start,
            session_id: stat.session_id,
            session_start,
            env: String::new(),
            stdio,
            stdio_trunc: [false, false, false],
            dirty: true,
        };

        if scan_pipes {
            self.record_pipes(&record);
        }

        Ok(record)
    }

    /// Stdio fds whose `/proc` target starts with `pipe:` are shared kernel
    /// pipes rather than real files: mint (or retrieve) one shared
    /// pseudo-descriptor per endpoint and register every other live process
    /// holding the other end, so its write-side (or read-side) IO record
    /// references the same path/fcreate key as this process's
    /// (`ProcessRecord._record_pipes`).
    fn record_pipes(&self, record: &ProcessRecord) {
        for (fd, target) in record.stdio.iter().enumerate() {
            if !target.starts_with("pipe:") {
                continue;
            }

            self.pipe_descriptors.gen_pipe(target, || pipe_identity(target));

            if let Err(err) = self.record_pipe_endpoint(record, fd, target) {
                log::warn!("pipe provenance tracking failed for pid {}: {err}", record.pid);
                continue;
            }

            for peer_pid in self.snapshot.all_pids() {
                if peer_pid == record.pid {
                    continue;
                }

                for peer_fd in 0..3u32 {
                    if self.snapshot.fd_target(peer_pid, peer_fd) != *target {
                        continue;
                    }

                    match self.build_process_record_inner(peer_pid, false) {
                        Ok(peer_record) => {
                            if let Err(err) = self.record_pipe_endpoint(&peer_record, peer_fd as usize, target) {
                                log::warn!("pipe provenance tracking failed for pid {peer_pid}: {err}");
                            }
                        }
                        Err(err) => log::warn!("pipe peer lookup failed for pid {peer_pid}: {err}"),
                    }
                }
            }
        }
    }

    /// Write a pipe endpoint's `file`/`file_last` rows (if not already
    /// present), a full `process` row for `record` (pipe rows bypass the
    /// descriptor-keyed caches `register_open`/`register_close` normally
    /// flush through, so the process row has to land here directly), and a
    /// read or write row at the special `io_time=0` pipe sentinel
    /// (`Management.register_open`/`register_read`/`register_write`, called
    /// with `io_time=0` from `_record_pipes`).
    fn record_pipe_endpoint(&self, record: &ProcessRecord, fd: usize, pipe: &str) -> Result<()> {
        let conn = self.conn.lock();

        let fcreate: f64 = conn
            .query_row("SELECT fcreate FROM file_last WHERE path = ?1", params![pipe], |row| row.get(0))
            .unwrap_or(record.pstart);
        conn.execute(
            "INSERT OR IGNORE INTO file_last (path, fcreate) VALUES (?1, ?2)",
            params![pipe, fcreate],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO file (path, fcreate, type) VALUES (?1, ?2, 'file')",
            params![pipe, fcreate],
        )?;

        replace_process_row(&conn, &self.system_name, self.mid, record)?;

        let table = if fd == 0 { "read" } else { "write" };
        conn.execute(
            &format!("REPLACE INTO {table} (phost, pstart, pid, path, fcreate, start, stop, ops) VALUES (?1,?2,?3,?4,?5,0,0,?6)"),
            params![self.system_name, record.pstart, record.pid, pipe, fcreate, OpKind::IO.bits() as i64],
        )?;

        Ok(())
    }

    /// The backing-real path a process's CWD resolves to, if that CWD lies
    /// under the mount (`FileEntry.get_paths`'s `abs_mount` classification in
    /// `ProcessRecord._update`'s CWD tracking). `None` for an empty CWD or one
    /// outside the mount entirely.
    fn cwd_dependency_path(&self, cwd: &str) -> Option<String> {
        if cwd.is_empty() {
            return None;
        }
        let paths = Paths::compute(cwd, Path::new(&self.root), Path::new(&self.mount));
        if paths.orig_type == OrigType::AbsMount {
            Some(paths.abs_real.to_string_lossy().to_string())
        } else {
            None
        }
    }

    /// Record that a process's working directory lies under the mount, as a
    /// self-contained `OP_CD` read dependency (`Management.register_read`
    /// with `update_process=False`, called from `ProcessRecord._update`).
    /// Written directly against the connection rather than through the
    /// state-locked registration path, since this runs from inside
    /// `get_or_update_process`, which may already hold `state`'s lock.
    fn register_cwd_read(&self, abs_real: &str, pid: u32, pstart: f64) -> Result<()> {
        let conn = self.conn.lock();
        let fcreate: f64 = conn
            .query_row("SELECT fcreate FROM file_last WHERE path = ?1", params![abs_real], |row| row.get(0))
            .unwrap_or(pstart);
        conn.execute(
            "INSERT OR IGNORE INTO file_last (path, fcreate) VALUES (?1, ?2)",
            params![abs_real, fcreate],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO file (path, fcreate, type) VALUES (?1, ?2, 'dir')",
            params![abs_real, fcreate],
        )?;
        conn.execute(
            "REPLACE INTO read (phost, pstart, pid, path, fcreate, start, stop, ops) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![self.system_name, pstart, pid, abs_real, fcreate, pstart, pstart, OpKind::CD.bits() as i64],
        )?;
        Ok(())
    }

    fn get_last(&self, state: &mut State, path: &str) -> Result<f64> {
        if let Some(&cached) = state.file_last_cache.get(path) {
            return Ok(cached);
        }

        let conn = self.conn.lock();
        let existing: Option<f64> = conn
            .query_row("SELECT fcreate FROM file_last WHERE path = ?1", params![path], |row| row.get(0))
            .ok();
        drop(conn);

        if let Some(fcreate) = existing {
            state.file_last_cache.insert(path.to_string(), fcreate);
            return Ok(fcreate);
        }

        self.set_last(state, path)
    }

    fn set_last(&self, state: &mut State, path: &str) -> Result<f64> {
        let fcreate = now();
        state.file_last_cache.insert(path.to_string(), fcreate);

        let conn = self.conn.lock();
        conn.execute(
            "REPLACE INTO file_last (path, fcreate) VALUES (?1, ?2)",
            params![path, fcreate],
        )?;
        Ok(fcreate)
    }

    /// Register a freshly opened descriptor: cache its file/process/IO
    /// records and optionally seed an initial read/write event
    /// (`Management.register_open`).
    pub fn register_open(
        &self,
        descriptor: &Descriptor,
        pid: u32,
        read: bool,
        write: bool,
        record_file: bool,
        record_process: bool,
        update_last: bool,
    ) -> Result<()> {
        let path = descriptor.identity.paths.abs_real.to_string_lossy().to_string();
        let mut state = self.state.lock();

        if update_last {
            self.set_last(&mut state, &path)?;
        }

        if record_file {
            let fcreate = self.get_last(&mut state, &path)?;
            state.file_lookup.insert(
                descriptor.id,
                FileRecord {
                    path: path.clone(),
                    fcreate,
                    file_type: if descriptor.identity.is_dir { "dir".to_string() } else { "file".to_string() },
                },
            );
        }

        state
            .io_lookup
            .entry(descriptor.id)
            .or_default()
            .entry(pid)
            .or_insert_with(IoRecord::default);

        if record_process {
            self.get_or_update_process(&mut state, pid)?;
        }

        drop(state);

        if read {
            self.register_read(descriptor, pid, OpKind::IO, false, None)?;
        }
        if write {
            self.register_write(descriptor, pid, OpKind::IO | OpKind::TRUNCATE, false, None)?;
        }

        Ok(())
    }

    /// Note a read event, opening the descriptor's record for this PID if it
    /// wasn't already tracked (`Management.register_read`).
    pub fn register_read(&self, descriptor: &Descriptor, pid: u32, op_type: OpKind, update_process: bool, io_time: Option<f64>) -> Result<()> {
        let at = io_time.unwrap_or_else(now);
        let mut state = self.state.lock();

        if !state.io_lookup.get(&descriptor.id).map(|m| m.contains_key(&pid)).unwrap_or(false) {
            drop(state);
            self.register_open(descriptor, pid, false, false, false, true, false)?;
            state = self.state.lock();
        }

        state
            .io_lookup
            .entry(descriptor.id)
            .or_default()
            .entry(pid)
            .or_insert_with(IoRecord::default)
            .update(IoDirection::Read, op_type, at);

        if update_process {
            self.get_or_update_process(&mut state, pid)?;
        }

        Ok(())
    }

    /// Note a write event, and remember a truncation against this file for
    /// the process's redirection detection (`Management.register_write`).
    pub fn register_write(&self, descriptor: &Descriptor, pid: u32, op_type: OpKind, update_process: bool, io_time: Option<f64>) -> Result<()> {
        let at = io_time.unwrap_or_else(now);
        let mut state = self.state.lock();

        if !state.io_lookup.get(&descriptor.id).map(|m| m.contains_key(&pid)).unwrap_or(false) {
            drop(state);
            self.register_open(descriptor, pid, false, false, false, true, false)?;
            state = self.state.lock();
        }

        state
            .io_lookup
            .entry(descriptor.id)
            .or_default()
            .entry(pid)
            .or_insert_with(IoRecord::default)
            .update(IoDirection::Write, op_type, at);

        if update_process {
            self.get_or_update_process(&mut state, pid)?;
        }

        Ok(())
    }

    /// Flush a descriptor's file and IO records to the database and drop its
    /// caches (`Management.register_close`).
    pub fn register_close(&self, descriptor: &Descriptor, write_process: bool) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(file_record) = state.file_lookup.get(&descriptor.id).cloned() {
            self.write_file_record(&mut state, &file_record)?;
        }

        let io_records: Vec<(u32, IoRecord)> = state
            .io_lookup
            .get(&descriptor.id)
            .map(|m| m.iter().map(|(pid, rec)| (*pid, rec.clone())).collect())
            .unwrap_or_default();

        for (pid, io_record) in io_records {
            if let Some(file_record) = state.file_lookup.get(&descriptor.id).cloned() {
                self.write_io_record(&mut state, pid, &io_record, &file_record)?;
            }
            if write_process {
                if let Some(process_record) = state.process_lookup.get(&pid).cloned() {
                    self.write_process_record(&mut state, &process_record)?;
                }
            }
        }

        state.file_lookup.remove(&descriptor.id);
        state.io_lookup.remove(&descriptor.id);

        Ok(())
    }

    /// Drop cached records for a descriptor without writing them
    /// (`Management.clean_descriptor`): used for ephemeral/pipe descriptors.
    pub fn clean_descriptor(&self, descriptor: DescriptorId) {
        let mut state = self.state.lock();
        state.file_lookup.remove(&descriptor);
        state.io_lookup.remove(&descriptor);
    }

    fn write_file_record(&self, state: &mut State, record: &FileRecord) -> Result<()> {
        let key = (record.path.clone(), record.fcreate as i64);
        if state.file_dirty_cache.contains(&key) {
            return Ok(());
        }

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO file (path, fcreate, type) VALUES (?1, ?2, ?3)",
            params![record.path, record.fcreate, record.file_type],
        )?;
        drop(conn);

        state.file_dirty_cache.insert(key);
        Ok(())
    }

    fn write_process_record(&self, state: &mut State, record: &ProcessRecord) -> Result<()> {
        if !record.dirty {
            return Ok(());
        }

        let conn = self.conn.lock();
        replace_process_row(&conn, &self.system_name, self.mid, record)?;
        drop(conn);

        if let Some(entry) = state.process_lookup.get_mut(&record.pid) {
            entry.dirty = false;
        }

        Ok(())
    }

    fn write_io_record(&self, state: &mut State, pid: u32, record: &IoRecord, file_record: &FileRecord) -> Result<()> {
        let process_record = self
            .get_or_update_process(state, pid)?;
        let conn = self.conn.lock();

        for (table, start, end, ops) in [
            ("read", record.read_start, record.read_end, record.read_ops),
            ("write", record.write_start, record.write_end, record.write_ops),
        ] {
            if let Some(start) = start {
                let lookup: Option<(f64, i64)> = conn
                    .query_row(
                        &format!(
                            "SELECT start, ops FROM {table} WHERE phost = ?1 AND pstart = ?2 AND pid = ?3 AND path = ?4 AND fcreate = ?5"
                        ),
                        params![self.system_name, process_record.pstart, pid, file_record.path, file_record.fcreate],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .ok();

                let (merged_start, merged_ops) = match lookup {
                    Some((prior_start, prior_ops)) => (prior_start, ops.bits() as i64 | prior_ops),
                    None => (start, ops.bits() as i64),
                };

                conn.execute(
                    &format!("REPLACE INTO {table} (phost, pstart, pid, path, fcreate, start, stop, ops) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
                    params![
                        self.system_name,
                        process_record.pstart,
                        pid,
                        file_record.path,
                        file_record.fcreate,
                        merged_start,
                        end,
                        merged_ops,
                    ],
                )?;
            }
        }

        Ok(())
    }

    /// Register an ephemeral, self-contained read event (no lingering
    /// descriptor) — used for metadata-only operations (`Management.register_op_read`).
    pub fn register_op_read(&self, descriptor: &Descriptor, pid: u32, op_type: OpKind) -> Result<()> {
        self.register_open(descriptor, pid, false, false, true, true, false)?;
        self.register_read(descriptor, pid, op_type, false, None)?;
        self.register_close(descriptor, true)
    }

    /// Register an ephemeral, self-contained write event
    /// (`Management.register_op_write`).
    pub fn register_op_write(&self, descriptor: &Descriptor, pid: u32, op_type: OpKind, create: bool) -> Result<()> {
        self.register_open(descriptor, pid, false, false, true, true, create)?;
        self.register_write(descriptor, pid, op_type, false, None)?;
        self.register_close(descriptor, true)
    }

    /// Borrow the underlying connection, for read-only graph/replay queries
    /// that need direct SQL access the registration API doesn't cover.
    pub fn connection(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Look up the `(path, fcreate)` key a path currently resolves to, for
    /// building a [`super::graph::FileKey`] to pass to `build_graph`
    /// (`Provenance.get_graph`'s path-to-key lookup).
    pub fn file_key(&self, path: &Path) -> Result<(String, f64)> {
        let path_str = path.to_string_lossy().to_string();
        let mut state = self.state.lock();
        let fcreate = self.get_last(&mut state, &path_str)?;
        Ok((path_str, fcreate))
    }
}

fn hostname() -> String {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

/// Shared `REPLACE INTO process` used by both the normal descriptor-close
/// flush ([`Store::write_process_record`]) and the direct pipe-endpoint
/// write ([`Store::record_pipe_endpoint`]), which never goes through a
/// descriptor at all.
fn replace_process_row(conn: &Connection, system_name: &str, mid: i64, record: &ProcessRecord) -> Result<()> {
    conn.execute(
        "REPLACE INTO process (phost, pstart, pid, parent_start, parent_pid, cmd, exe, hash, cwd, \
         tgid_start, tgid, session_start, session_id, env, stdin, stdout, stderr, trunc_stdout, trunc_stderr, mid) \
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
        params![
            system_name,
            record.pstart,
            record.pid,
            record.parent_start,
            record.parent_pid,
            record.cmd,
            record.exe,
            record.hash,
            record.cwd,
            record.tgid_start,
            record.tgid,
            record.session_start,
            record.session_id,
            record.env,
            record.stdio[0],
            record.stdio[1],
            record.stdio[2],
            record.stdio_trunc[1] as i64,
            record.stdio_trunc[2] as i64,
            mid,
        ],
    )?;
    Ok(())
}

/// A [`FileIdentity`] for a shared pipe endpoint string (e.g. `pipe:[12345]`),
/// used only to mint/retrieve its pseudo-descriptor id
/// (`DescriptorEntry.gen_pipe`'s `FileEntry(pipe, core)`).
fn pipe_identity(pipe: &str) -> FileIdentity {
    FileIdentity {
        paths: Paths {
            relative: pipe.to_string(),
            abs_real: PathBuf::from(pipe),
            abs_mount: PathBuf::from(pipe),
            abs_virt: PathBuf::from(pipe),
            orig_type: OrigType::Relative,
        },
        kind: Kind::Pipe,
        valid: true,
        is_dir: false,
        mtime: 0.0,
        init_size: 0,
        derived_source: None,
        virt_action: None,
        derived_actions: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Kind, OrigType, Paths};
    use crate::provenance::snapshot::ProcessStat;
    use std::path::PathBuf;

    struct FakeSnapshot;
    impl ProcessSnapshot for FakeSnapshot {
        fn stat(&self, pid: u32) -> Result<ProcessStat> {
            Ok(ProcessStat {
                start: 1000.0 + pid as f64,
                parent_pid: 0,
                session_id: 0,
                tgid: pid,
            })
        }
        fn tgid(&self, pid: u32) -> Result<u32> {
            Ok(pid)
        }
        fn exe(&self, _pid: u32) -> String {
            "/usr/bin/fake".to_string()
        }
        fn exe_hash(&self, _exe: &str) -> String {
            "fakehash".to_string()
        }
        fn cwd(&self, _pid: u32) -> String {
            "/tmp".to_string()
        }
        fn cmdline(&self, _pid: u32) -> String {
            "fake --arg".to_string()
        }
        fn fd_target(&self, _pid: u32, _fd: u32) -> String {
            String::new()
        }
        fn all_pids(&self) -> Vec<u32> {
            vec![]
        }
        fn boot_time(&self) -> Result<f64> {
            Ok(0.0)
        }
        fn clock_ticks_per_sec(&self) -> i64 {
            100
        }
    }

    fn fake_descriptor(id: DescriptorId, path: &str) -> Descriptor {
        Descriptor {
            id,
            identity: crate::identity::FileIdentity {
                paths: Paths {
                    relative: path.to_string(),
                    abs_real: PathBuf::from(path),
                    abs_mount: PathBuf::from(path),
                    abs_virt: PathBuf::from(path),
                    orig_type: OrigType::Relative,
                },
                kind: Kind::Real,
                valid: true,
                is_dir: false,
                mtime: 0.0,
                init_size: 0,
                derived_source: None,
                virt_action: None,
                derived_actions: Default::default(),
            },
            flags: Some(libc::O_RDONLY),
            open_pid: 42,
            os_fd: None,
        }
    }

    #[test]
    fn open_read_close_roundtrip_writes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Path::new("/root"), Path::new("/mnt"), Arc::new(FakeSnapshot)).unwrap();

        let descriptor = fake_descriptor(1, "/root/a.txt");
        store.register_open(&descriptor, 42, true, false, true, true, false).unwrap();
        store.register_read(&descriptor, 42, OpKind::IO, false, None).unwrap();
        store.register_close(&descriptor, true).unwrap();

        let conn = store.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM process", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    /// Pid 10 writes one end of `pipe:[99]` (its fd 1) and pid 20 reads the
    /// other (its fd 0); only these two pids exist.
    struct PipeSnapshot;
    impl ProcessSnapshot for PipeSnapshot {
        fn stat(&self, pid: u32) -> Result<ProcessStat> {
            Ok(ProcessStat {
                start: 2000.0 + pid as f64,
                parent_pid: 0,
                session_id: 0,
                tgid: pid,
            })
        }
        fn tgid(&self, pid: u32) -> Result<u32> {
            Ok(pid)
        }
        fn exe(&self, pid: u32) -> String {
            format!("/bin/proc{pid}")
        }
        fn exe_hash(&self, _exe: &str) -> String {
            "fakehash".to_string()
        }
        fn cwd(&self, _pid: u32) -> String {
            String::new()
        }
        fn cmdline(&self, pid: u32) -> String {
            format!("proc{pid}")
        }
        fn fd_target(&self, pid: u32, fd: u32) -> String {
            match (pid, fd) {
                (10, 1) => "pipe:[99]".to_string(),
                (20, 0) => "pipe:[99]".to_string(),
                _ => String::new(),
            }
        }
        fn all_pids(&self) -> Vec<u32> {
            vec![10, 20]
        }
        fn boot_time(&self) -> Result<f64> {
            Ok(0.0)
        }
        fn clock_ticks_per_sec(&self) -> i64 {
            100
        }
    }

    #[test]
    fn pipe_stdio_registers_both_ends_against_the_shared_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), Path::new("/root"), Path::new("/mnt"), Arc::new(PipeSnapshot)).unwrap();

        let descriptor = fake_descriptor(1, "/root/unrelated.txt");
        store.register_op_read(&descriptor, 10, OpKind::IO).unwrap();

        let conn = store.conn.lock();
        let processes: i64 = conn.query_row("SELECT COUNT(*) FROM process", [], |row| row.get(0)).unwrap();
        assert_eq!(processes, 2);

        let writer: i64 = conn
            .query_row("SELECT COUNT(*) FROM write WHERE pid = 10 AND path = 'pipe:[99]'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(writer, 1);

        let reader: i64 = conn
            .query_row("SELECT COUNT(*) FROM read WHERE pid = 20 AND path = 'pipe:[99]'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(reader, 1);
    }
}
