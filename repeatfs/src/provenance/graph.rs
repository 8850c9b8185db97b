//! Causal provenance graph construction, mirroring `provenance/graph.py`'s
//! `build_graph`/`_finalize_graph`. Renders to JSON only; Graphviz/HTML
//! rendering is out of scope.

use std::collections::{BTreeMap, VecDeque};

use rusqlite::params;
use serde_json::{json, Value};

use crate::error::Result;

use super::record::OpKind;
use super::store::Store;

/// A file identity inside a graph: its real path plus the logical "version"
/// (creation timestamp) an IO record is scoped to.
pub type FileKey = (String, f64);
/// A process identity inside a graph: `(host, pstart, pid)`.
pub type ProcessKey = (String, f64, u32);

fn file_id(key: &FileKey) -> String {
    format!("{}|{}", key.0, key.1)
}

fn process_id(key: &ProcessKey) -> String {
    format!("{}|{}|{}", key.0, key.1, key.2)
}

struct ProcessRow {
    key: ProcessKey,
    parent_start: f64,
    parent_pid: u32,
    tgid_start: f64,
    tgid: u32,
    session_start: f64,
    session_id: u32,
    json: Value,
}

/// Walk the causal lineage of `target` backward through writes and reads,
/// within an `io_epsilon`-second window, producing a JSON-renderable graph
/// (`Graph.build_graph`).
pub fn build_graph(store: &Store, target: &FileKey, io_epsilon: f64, op_filter: OpKind) -> Result<Value> {
    let conn = store.connection();

    let mut files: BTreeMap<String, Value> = BTreeMap::new();
    let mut processes: BTreeMap<String, Value> = BTreeMap::new();
    let mut reads: BTreeMap<String, Value> = BTreeMap::new();
    let mut writes: BTreeMap<String, Value> = BTreeMap::new();
    let mut sessions: BTreeMap<String, Value> = BTreeMap::new();

    let mut remaining: VecDeque<(FileKey, Option<ProcessKey>, Option<f64>)> = VecDeque::new();
    remaining.push_front((target.clone(), None, None));

    while let Some((file_key, read_process, read_stop)) = remaining.pop_back() {
        let fid = file_id(&file_key);

        if !files.contains_key(&fid) {
            let file_row: Option<(String, String)> = conn
                .query_row(
                    "SELECT type, path FROM file WHERE path = ?1 AND fcreate = ?2",
                    params![file_key.0, file_key.1],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .ok();

            if let Some((file_type, path)) = file_row {
                files.insert(fid.clone(), json!({ "path": path, "fcreate": file_key.1, "type": file_type }));
            }

            let mut write_stmt = conn.prepare(
                "SELECT w.*, p.* FROM file f \
                 NATURAL JOIN write w NATURAL JOIN process p \
                 WHERE f.path = ?1 AND f.fcreate = ?2 AND (w.ops & ?3) > 0 \
                 AND (?4 IS NULL OR w.start = 0 OR w.start <= (?4 + ?5)) \
                 ORDER BY w.start DESC",
            )?;

            let write_rows: Vec<(ProcessRow, f64, i64, f64)> = write_stmt
                .query_map(
                    params![file_key.0, file_key.1, op_filter.bits() as i64, read_stop, io_epsilon],
                    |row| {
                        let phost: String = row.get("phost")?;
                        let pstart: f64 = row.get("pstart")?;
                        let pid: u32 = row.get("pid")?;
                        let write_stop: f64 = row.get("stop")?;
                        let write_start: f64 = row.get("start")?;
                        let write_ops: i64 = row.get("ops")?;

                        let proc_json = process_row_json(row)?;
                        let parent_start: f64 = row.get("parent_start")?;
                        let parent_pid: u32 = row.get("parent_pid")?;
                        let tgid_start: f64 = row.get("tgid_start")?;
                        let tgid: u32 = row.get("tgid")?;
                        let session_start: f64 = row.get("session_start")?;
                        let session_id: u32 = row.get("session_id")?;

                        Ok((
                            ProcessRow {
                                key: (phost, pstart, pid),
                                parent_start,
                                parent_pid,
                                tgid_start,
                                tgid,
                                session_start,
                                session_id,
                                json: proc_json,
                            },
                            write_stop,
                            write_ops,
                            write_start,
                        ))
                    },
                )?
                .filter_map(|r| r.ok())
                .collect();
            drop(write_stmt);

            for (write_process, mut write_stop, write_ops, write_start) in write_rows {
                if write_stop == 0.0 {
                    write_stop = read_stop.unwrap_or(0.0);
                }

                let write_process_id = write_process.key.clone();
                let wid = format!("{}#{}", process_id(&write_process_id), fid);
                writes.insert(
                    wid,
                    json!({ "process": process_id(&write_process_id), "file": fid, "start": write_start, "stop": write_stop, "ops": write_ops }),
                );

                let mut lineage = write_process;
                let mut lineage_stop = write_stop;
                let mut session_closed = false;

                loop {
                    let lid = process_id(&lineage.key);
                    processes.insert(lid.clone(), lineage.json.clone());

                    let thread_key = (lineage.key.0.clone(), lineage.tgid_start, lineage.tgid);
                    if thread_key != lineage.key {
                        if let Some(thread_json) = load_process_json(&conn, &thread_key)? {
                            processes.insert(process_id(&thread_key), thread_json);
                        }
                    }

                    if lineage.parent_pid == 0 {
                        break;
                    }

                    let is_session_leader = (lineage.key.1, lineage.key.2) == (lineage.session_start, lineage.session_id);
                    if !session_closed && is_session_leader {
                        sessions.insert(lid.clone(), lineage.json.clone());
                        session_closed = true;
                    }

                    if session_closed {
                        let parent_key = (lineage.key.0.clone(), lineage.parent_start, lineage.parent_pid);
                        lineage = match load_process_row(&conn, &parent_key)? {
                            Some(row) => row,
                            None => break,
                        };
                        continue;
                    }

                    let mut read_stmt = conn.prepare(
                        "SELECT f.path, f.fcreate, r.stop FROM file f \
                         NATURAL JOIN read r NATURAL JOIN process p \
                         WHERE p.phost = ?1 AND p.pstart = ?2 AND p.pid = ?3 AND (r.ops & ?4) > 0 \
                         AND (r.start = 0 OR r.start <= (?5 + ?6)) \
                         ORDER BY r.start DESC",
                    )?;

                    let read_files: Vec<(String, f64, f64)> = read_stmt
                        .query_map(
                            params![lineage.key.0, lineage.key.1, lineage.key.2, op_filter.bits() as i64, lineage_stop, io_epsilon],
                            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                        )?
                        .filter_map(|r| r.ok())
                        .collect();
                    drop(read_stmt);

                    for (read_path, read_fcreate, mut inner_read_stop) in &read_files {
                        if *inner_read_stop == 0.0 {
                            inner_read_stop = &lineage_stop;
                        }
                        remaining.push_front(((read_path.clone(), *read_fcreate), Some(lineage.key.clone()), Some(*inner_read_stop)));
                    }

                    lineage_stop = lineage.key.1;
                    let parent_key = (lineage.key.0.clone(), lineage.parent_start, lineage.parent_pid);
                    lineage = match load_process_row(&conn, &parent_key)? {
                        Some(row) => row,
                        None => break,
                    };
                }
            }
        }

        if let Some(process_key) = read_process {
            let pid_str = process_id(&process_key);
            let read_row: Option<(f64, f64, i64)> = conn
                .query_row(
                    "SELECT start, stop, ops FROM read WHERE phost = ?1 AND pstart = ?2 AND pid = ?3 AND path = ?4 AND fcreate = ?5",
                    params![process_key.0, process_key.1, process_key.2, file_key.0, file_key.1],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .ok();

            if let Some((start, stop, ops)) = read_row {
                let rid = format!("{pid_str}#{fid}");
                reads.insert(rid, json!({ "process": pid_str, "file": fid, "start": start, "stop": stop, "ops": ops }));
            }
        }
        let _ = read_stop;
    }

    let common_root = store.root_str().to_string();
    let files: BTreeMap<String, Value> = files.into_iter().map(|(k, v)| (k, finalize_file(v, &common_root))).collect();
    let processes: BTreeMap<String, Value> = processes.into_iter().map(|(k, v)| (k, finalize_process(v, &common_root))).collect();
    let sessions: BTreeMap<String, Value> = sessions.into_iter().map(|(k, v)| (k, finalize_process(v, &common_root))).collect();

    Ok(json!({
        "target": file_id(target),
        "file": Value::Object(files.into_iter().collect()),
        "process": Value::Object(processes.into_iter().collect()),
        "read": Value::Object(reads.into_iter().collect()),
        "write": Value::Object(writes.into_iter().collect()),
        "session": Value::Object(sessions.into_iter().collect()),
    }))
}

/// Replace every occurrence of the common root with the `$$$` token so a
/// replayed graph can be rehydrated against whatever mount it is replayed
/// from (`Graph._finalize_graph`'s path redaction).
fn redact(value: &str, common_root: &str) -> String {
    if common_root.is_empty() {
        value.to_string()
    } else {
        value.replace(common_root, "$$$")
    }
}

fn mount_relative(path: &str, common_root: &str) -> String {
    match path.strip_prefix(common_root) {
        Some(rest) => rest.trim_start_matches('/').to_string(),
        None => ".".to_string(),
    }
}

/// Rewrite a file node's path to mount-relative for display/replay, keeping
/// the lookup keys (which are computed from the real path before this runs)
/// untouched.
fn finalize_file(mut value: Value, common_root: &str) -> Value {
    if let Some(path) = value.get("path").and_then(|v| v.as_str()).map(str::to_string) {
        value["path"] = Value::String(mount_relative(&path, common_root));
    }
    value
}

/// Split argv on NUL, redact absolute paths in argv/env/stdio to the
/// common-root token, and rewrite `cwd` to a `{abs, rel_mount}` pair,
/// consumed in turn by `replay::execute_chain`.
fn finalize_process(mut value: Value, common_root: &str) -> Value {
    if let Some(cmd) = value.get("cmd").and_then(|v| v.as_str()).map(str::to_string) {
        let argv: Vec<String> = cmd.split('\0').filter(|s| !s.is_empty()).map(|s| redact(s, common_root)).collect();
        value["cmd"] = Value::String(argv.join("\0"));
        value["argv"] = Value::Array(argv.into_iter().map(Value::String).collect());
    }

    if let Some(exe) = value.get("exe").and_then(|v| v.as_str()).map(str::to_string) {
        value["exe"] = Value::String(redact(&exe, common_root));
    }

    if let Some(env) = value.get("env").and_then(|v| v.as_str()).map(str::to_string) {
        value["env"] = Value::String(redact(&env, common_root));
    }

    for field in ["stdin", "stdout", "stderr"] {
        if let Some(target) = value.get(field).and_then(|v| v.as_str()).map(str::to_string) {
            value[field] = Value::String(redact(&target, common_root));
        }
    }

    if let Some(cwd) = value.get("cwd").and_then(|v| v.as_str()).map(str::to_string) {
        value["cwd"] = json!({ "abs": redact(&cwd, common_root), "rel_mount": mount_relative(&cwd, common_root) });
    }

    value
}

fn process_row_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "phost": row.get::<_, String>("phost")?,
        "pstart": row.get::<_, f64>("pstart")?,
        "pid": row.get::<_, u32>("pid")?,
        "parent_start": row.get::<_, f64>("parent_start")?,
        "parent_pid": row.get::<_, u32>("parent_pid")?,
        "cmd": row.get::<_, String>("cmd")?,
        "exe": row.get::<_, String>("exe")?,
        "hash": row.get::<_, String>("hash")?,
        "cwd": row.get::<_, String>("cwd")?,
        "tgid_start": row.get::<_, f64>("tgid_start")?,
        "tgid": row.get::<_, u32>("tgid")?,
        "session_start": row.get::<_, f64>("session_start")?,
        "session_id": row.get::<_, u32>("session_id")?,
        "env": row.get::<_, String>("env")?,
        "stdin": row.get::<_, String>("stdin")?,
        "stdout": row.get::<_, String>("stdout")?,
        "stderr": row.get::<_, String>("stderr")?,
        "trunc_stdout": row.get::<_, i64>("trunc_stdout")? != 0,
        "trunc_stderr": row.get::<_, i64>("trunc_stderr")? != 0,
    }))
}

fn load_process_row(conn: &rusqlite::Connection, key: &ProcessKey) -> Result<Option<ProcessRow>> {
    let row = conn
        .query_row(
            "SELECT * FROM process WHERE phost = ?1 AND pstart = ?2 AND pid = ?3",
            params![key.0, key.1, key.2],
            |row| {
                let parent_start: f64 = row.get("parent_start")?;
                let parent_pid: u32 = row.get("parent_pid")?;
                let tgid_start: f64 = row.get("tgid_start")?;
                let tgid: u32 = row.get("tgid")?;
                let session_start: f64 = row.get("session_start")?;
                let session_id: u32 = row.get("session_id")?;
                let json = process_row_json(row)?;
                Ok(ProcessRow {
                    key: key.clone(),
                    parent_start,
                    parent_pid,
                    tgid_start,
                    tgid,
                    session_start,
                    session_id,
                    json,
                })
            },
        )
        .ok();
    Ok(row)
}

fn load_process_json(conn: &rusqlite::Connection, key: &ProcessKey) -> Result<Option<Value>> {
    Ok(load_process_row(conn, key)?.map(|r| r.json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DescriptorId};
    use crate::identity::{FileIdentity, Kind, OrigType, Paths};
    use crate::provenance::snapshot::{ProcessSnapshot, ProcessStat};
    use std::path::PathBuf;
    use std::sync::Arc;

    struct FakeSnapshot;
    impl ProcessSnapshot for FakeSnapshot {
        fn stat(&self, pid: u32) -> Result<ProcessStat> {
            Ok(ProcessStat { start: 100.0 + pid as f64, parent_pid: if pid > 1 { 1 } else { 0 }, session_id: pid, tgid: pid })
        }
        fn tgid(&self, pid: u32) -> Result<u32> {
            Ok(pid)
        }
        fn exe(&self, _pid: u32) -> String {
            "/bin/cat".to_string()
        }
        fn exe_hash(&self, _exe: &str) -> String {
            "fakehash".to_string()
        }
        fn cwd(&self, _pid: u32) -> String {
            "/tmp".to_string()
        }
        fn cmdline(&self, _pid: u32) -> String {
            "cat file".to_string()
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
            identity: FileIdentity {
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
            open_pid: 2,
            os_fd: None,
        }
    }

    #[test]
    fn builds_graph_around_single_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), std::path::Path::new("/root"), std::path::Path::new("/mnt"), Arc::new(FakeSnapshot)).unwrap();

        let descriptor = fake_descriptor(1, "/root/out.txt");
        store.register_open(&descriptor, 2, false, true, true, true, true).unwrap();
        store.register_write(&descriptor, 2, OpKind::IO, false, None).unwrap();
        store.register_close(&descriptor, true).unwrap();

        let fcreate: f64 = {
            let conn = store.connection();
            conn.query_row("SELECT fcreate FROM file_last WHERE path = ?1", params!["/root/out.txt"], |row| row.get(0))
                .unwrap()
        };

        let graph = build_graph(&store, &("/root/out.txt".to_string(), fcreate), 7.0, OpKind::all()).unwrap();
        assert!(graph["file"].as_object().unwrap().contains_key(&file_id(&("/root/out.txt".to_string(), fcreate))));
        assert!(!graph["process"].as_object().unwrap().is_empty());
    }
}
