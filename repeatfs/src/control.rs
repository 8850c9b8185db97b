//! Control Endpoint, with behavior inferred from `api.py`/`routing.py`
//! (those sources only gesture at the wire format this module pins down
//! precisely).
//!
//! A pseudo-file that accepts newline-delimited JSON requests and emits
//! newline-delimited JSON responses. One session per open descriptor: writes
//! accumulate bytes until a newline is seen, at which point exactly one
//! request is parsed and dispatched; the response (one or more JSON lines,
//! the last tagged `"final": true`) is queued for subsequent reads.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Operation;
use crate::descriptor::DescriptorId;
use crate::identity::Kind;
use crate::provenance::{graph, replay, OpKind};
use crate::Service;

/// The three recognized control commands.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControlRequest {
    Shutdown,
    ConfigVdf {
        path: String,
        #[serde(default)]
        options: HashMap<String, Value>,
    },
    Replicate {
        action: String,
        provenance: Value,
        #[serde(default)]
        expand: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    status: &'static str,
    message: String,
    #[serde(rename = "final")]
    is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Self {
        ControlResponse { status: "ok", message: message.into(), is_final: true, stdout: None, stderr: None }
    }

    fn info(message: impl Into<String>, is_final: bool) -> Self {
        ControlResponse { status: "info", message: message.into(), is_final, stdout: None, stderr: None }
    }

    fn warning(message: impl Into<String>, is_final: bool) -> Self {
        ControlResponse { status: "warning", message: message.into(), is_final, stdout: None, stderr: None }
    }

    fn error(message: impl Into<String>) -> Self {
        ControlResponse { status: "error", message: message.into(), is_final: true, stdout: None, stderr: None }
    }

    fn unknown(command: &str) -> Self {
        ControlResponse { status: "unknown", message: format!("unrecognized command: {command}"), is_final: true, stdout: None, stderr: None }
    }

    fn malformed(err: impl std::fmt::Display) -> Self {
        ControlResponse { status: "malformed", message: err.to_string(), is_final: true, stdout: None, stderr: None }
    }

    fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec());
        line.push(b'\n');
        line
    }
}

/// Per-descriptor control session state: the not-yet-newline-terminated
/// input accumulator and the queued response bytes awaiting `read`.
#[derive(Default)]
struct Session {
    input: Vec<u8>,
    output: VecDeque<u8>,
}

/// Registry of open control-file sessions, owned by [`Service`].
#[derive(Default)]
pub struct ControlSessions {
    sessions: Mutex<HashMap<DescriptorId, Session>>,
}

impl ControlSessions {
    pub fn new() -> Self {
        ControlSessions { sessions: Mutex::new(HashMap::new()) }
    }

    /// A fresh session starts on every `open` of the control file.
    pub fn open_session(&self, descriptor: DescriptorId) {
        self.sessions.lock().insert(descriptor, Session::default());
    }

    pub fn close_session(&self, descriptor: DescriptorId) {
        self.sessions.lock().remove(&descriptor);
    }

    /// Feed bytes in; once a full newline-terminated line has accumulated,
    /// parse and dispatch exactly one request, queuing its response(s) for
    /// `read`.
    pub fn write(&self, service: &Arc<Service>, descriptor: DescriptorId, data: &[u8]) {
        let line = {
            let mut sessions = self.sessions.lock();
            let session = match sessions.get_mut(&descriptor) {
                Some(s) => s,
                None => return,
            };
            session.input.extend_from_slice(data);
            match session.input.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let line: Vec<u8> = session.input.drain(..=pos).collect();
                    line
                }
                None => return,
            }
        };

        let responses = dispatch(service, &line);

        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(&descriptor) {
            for response in &responses {
                session.output.extend(response.to_line());
            }
        }
    }

    /// Drain up to `size` queued response bytes.
    pub fn read(&self, descriptor: DescriptorId, size: usize) -> Vec<u8> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&descriptor) {
            Some(session) => {
                let n = size.min(session.output.len());
                session.output.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }
}

/// Parse and run exactly one request line, producing the ordered sequence of
/// responses to queue.
fn dispatch(service: &Arc<Service>, line: &[u8]) -> Vec<ControlResponse> {
    let text = match std::str::from_utf8(line) {
        Ok(t) => t.trim(),
        Err(err) => return vec![ControlResponse::malformed(err)],
    };
    if text.is_empty() {
        return vec![ControlResponse::malformed("empty request")];
    }

    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => return vec![ControlResponse::malformed(err)],
    };

    let command_name = raw.get("command").and_then(|v| v.as_str()).unwrap_or("").to_string();

    let request: ControlRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(_) if !matches!(command_name.as_str(), "shutdown" | "config_vdf" | "replicate") => {
            return vec![ControlResponse::unknown(&command_name)];
        }
        Err(err) => return vec![ControlResponse::malformed(err)],
    };

    match request {
        ControlRequest::Shutdown => handle_shutdown(),
        ControlRequest::ConfigVdf { path, options } => handle_config_vdf(service, &path, options),
        ControlRequest::Replicate { action, provenance, expand } => handle_replicate(service, &action, provenance, expand),
    }
}

fn handle_shutdown() -> Vec<ControlResponse> {
    std::thread::spawn(|| {
        std::thread::sleep(std::time::Duration::from_millis(50));
        std::process::exit(0);
    });
    vec![ControlResponse::ok("shutting down")]
}

/// `config_vdf`: merge runtime options into the matching cache entry and
/// force it through `RESET` so the next read re-derives from scratch.
fn handle_config_vdf(service: &Arc<Service>, path: &str, options: HashMap<String, Value>) -> Vec<ControlResponse> {
    let identity = service.resolver.resolve(path);
    if identity.kind != Kind::Vdf {
        return vec![ControlResponse::error(format!("not a VDF: {path}"))];
    }

    let entry = match service.cache_entry(&identity) {
        Ok(e) => e,
        Err(err) => return vec![ControlResponse::error(err.to_string())],
    };

    entry.update_config(options);

    // Descriptor 0 is never issued by `DescriptorTable` (IDs start at 1), so
    // it is safe to use as the ephemeral caller identity a bare RESET needs.
    if let Err(err) = entry.io(Operation::Reset, 0, None, 0, 0, &service.descriptors, &service.history, None) {
        return vec![ControlResponse::error(err.to_string())];
    }

    vec![ControlResponse::ok(format!("configured and reset {path}"))]
}

/// `replicate`: either list the session-chain shell-equivalents for a
/// supplied provenance graph (`list_cmds`) or actually replay them and
/// verify the result (`replicate`).
fn handle_replicate(service: &Arc<Service>, action: &str, graph_json: Value, expand: Vec<String>) -> Vec<ControlResponse> {
    let expand_set: HashSet<String> = expand.into_iter().collect();
    let chains = replay::session_chains(&graph_json, &expand_set, true);

    if chains.is_empty() {
        return vec![ControlResponse::ok("no session chains found in the supplied graph")];
    }

    match action {
        "list_cmds" => {
            let last = chains.len() - 1;
            chains
                .iter()
                .enumerate()
                .map(|(idx, chain)| ControlResponse::info(replay::build_command(&graph_json, chain), idx == last))
                .collect()
        }
        "replicate" => execute_and_verify(service, &graph_json, &chains),
        other => vec![ControlResponse::unknown(other)],
    }
}

fn execute_and_verify(service: &Arc<Service>, graph_json: &Value, chains: &[Vec<String>]) -> Vec<ControlResponse> {
    let mount = service.mount.to_string_lossy().to_string();
    let mut responses = Vec::new();

    for chain in chains {
        match replay::execute_chain(graph_json, chain, &mount) {
            Ok((stdout, stderr)) => {
                responses.push(ControlResponse {
                    status: "info",
                    message: format!("executed chain: {}", replay::build_command(graph_json, chain)),
                    is_final: false,
                    stdout: (!stdout.is_empty()).then(|| String::from_utf8_lossy(&stdout).into_owned()),
                    stderr: (!stderr.is_empty()).then(|| String::from_utf8_lossy(&stderr).into_owned()),
                });
            }
            Err(err) => responses.push(ControlResponse::warning(format!("chain execution failed: {err}"), false)),
        }
    }

    let target = match original_target_path(service, graph_json) {
        Some(t) => t,
        None => {
            responses.push(ControlResponse::error("could not build provenance graph for target: no target path in supplied graph".to_string()));
            return finalize_responses(responses);
        }
    };

    let fresh = match service
        .store
        .file_key(std::path::Path::new(&target))
        .and_then(|key| graph::build_graph(&service.store, &key, service.config.io_epsilon, OpKind::all()))
    {
        Ok(g) => g,
        Err(err) => {
            responses.push(ControlResponse::error(format!("could not build provenance graph for target: {err}")));
            return finalize_responses(responses);
        }
    };

    for chain in chains {
        for orig_id in chain {
            match fresh["process"].as_object().and_then(|m| find_match(graph_json, orig_id, m)) {
                Some(repl_id) => {
                    let hash_ok = replay::verify_hash_match(graph_json, orig_id, &fresh, &repl_id);
                    responses.push(ControlResponse::info(
                        format!("process {orig_id} executed as {repl_id}: hash {}", if hash_ok { "match" } else { "mismatch" }),
                        false,
                    ));

                    match replay::verify_child_match(graph_json, orig_id, &fresh, &repl_id) {
                        Some(pairs) => {
                            responses.push(ControlResponse::info(format!("process {orig_id}: {} children matched", pairs.len()), false));
                        }
                        None => {
                            responses.push(ControlResponse::warning(format!("process {orig_id}: child count/exe mismatch"), false));
                        }
                    }
                }
                None => responses.push(ControlResponse::warning(format!("no replay counterpart found for process {orig_id}"), false)),
            }
        }
    }

    finalize_responses(responses)
}

fn finalize_responses(mut responses: Vec<ControlResponse>) -> Vec<ControlResponse> {
    if responses.is_empty() {
        responses.push(ControlResponse::ok("replay complete"));
    }
    if let Some(last) = responses.last_mut() {
        last.is_final = true;
    }
    responses
}

/// Find the process in a freshly-built graph that matches `orig_id` in the
/// supplied graph by executable basename, nearest in start time
/// (`Replication._verify_execution`'s process-matching step).
fn find_match(orig_graph: &Value, orig_id: &str, fresh_processes: &serde_json::Map<String, Value>) -> Option<String> {
    let orig_exe = orig_graph["process"].get(orig_id)?["exe"].as_str().unwrap_or_default();
    let orig_base = orig_exe.rsplit('/').next().unwrap_or_default();

    fresh_processes
        .iter()
        .filter(|(_, p)| p["exe"].as_str().unwrap_or_default().rsplit('/').next().unwrap_or_default() == orig_base)
        .max_by(|a, b| {
            a.1["pstart"].as_f64().unwrap_or(0.0).partial_cmp(&b.1["pstart"].as_f64().unwrap_or(0.0)).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(id, _)| id.clone())
}

/// Recover the real backing path of the graph's `target` file, resolving the
/// `$$$` common-root token (or a mount-relative path) against this service's
/// root — the inverse of the graph finalize step's redaction.
fn original_target_path(service: &Arc<Service>, graph_json: &Value) -> Option<String> {
    let target_id = graph_json["target"].as_str()?;
    let path = graph_json["file"].get(target_id)?["path"].as_str()?;

    if let Some(rest) = path.strip_prefix("$$$") {
        return Some(format!("{}{}", service.root.to_string_lossy(), rest));
    }
    if path.starts_with('/') {
        return Some(path.to_string());
    }
    Some(service.root.join(path).to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn test_service() -> Arc<Service> {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("repeatfs.conf"),
            "block_size=4096\n\
             [entry]\n\
             match=\\.fastq$\n\
             ext=.fasta\n\
             cmd=cat {input}\n\
             output=stdout\n",
        )
        .unwrap();

        Service::new(dir.path().to_path_buf(), dir.path().to_path_buf(), dir.path()).unwrap()
    }

    #[test]
    fn malformed_json_reports_malformed() {
        let service = test_service();
        let responses = dispatch(&service, b"not json\n");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, "malformed");
        assert!(responses[0].is_final);
    }

    #[test]
    fn unknown_command_reports_unknown() {
        let service = test_service();
        let responses = dispatch(&service, b"{\"command\": \"frobnicate\"}\n");
        assert_eq!(responses[0].status, "unknown");
    }

    #[test]
    fn config_vdf_on_non_vdf_path_errors() {
        let service = test_service();
        let responses = dispatch(&service, b"{\"command\": \"config_vdf\", \"path\": \"nope\", \"options\": {}}\n");
        assert_eq!(responses[0].status, "error");
    }

    #[test]
    fn config_vdf_on_real_vdf_resets_entry() {
        let service = test_service();
        fs::write(service.root.join("x.fastq"), b">seq\nACGT\n").unwrap();

        let options: HashMap<String, Value> = [("expand_procs".to_string(), json!(true))].into_iter().collect();
        let request = json!({
            "command": "config_vdf",
            "path": "x.fastq+/x.fastq.fasta",
            "options": options,
        });
        let responses = dispatch(&service, format!("{request}\n").as_bytes());
        assert_eq!(responses[0].status, "ok");
    }

    #[test]
    fn list_cmds_renders_piped_chain() {
        let service = test_service();
        let graph = json!({
            "process": {
                "h|1|10": {
                    "phost": "h", "pstart": 1.0, "pid": 10, "parent_start": 0.0, "parent_pid": 1,
                    "tgid_start": 1.0, "tgid": 10, "session_start": 1.0, "session_id": 10,
                    "cmd": "cat\0in.txt", "exe": "/bin/cat", "hash": "abc",
                    "cwd": { "rel_mount": "." },
                    "stdin": "in.txt", "stdout": "out.txt", "stderr": "", "trunc_stdout": true, "trunc_stderr": false,
                }
            },
            "session": { "h|1|10": {} },
        });
        let request = json!({ "command": "replicate", "action": "list_cmds", "provenance": graph, "expand": [] });
        let responses = dispatch(&service, format!("{request}\n").as_bytes());
        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_final);
        assert!(responses[0].message.contains("cat in.txt"));
    }

    #[test]
    fn write_then_read_round_trips_a_response() {
        let service = test_service();
        let sessions = ControlSessions::new();
        sessions.open_session(1);
        sessions.write(&service, 1, b"{\"command\": \"frobnicate\"}\n");

        let mut collected = Vec::new();
        loop {
            let chunk = sessions.read(1, 64);
            if chunk.is_empty() {
                break;
            }
            collected.extend(chunk);
        }

        let text = String::from_utf8(collected).unwrap();
        let parsed: Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed["status"], "unknown");
        assert_eq!(parsed["final"], true);
    }

    #[test]
    fn write_buffers_until_newline() {
        let service = test_service();
        let sessions = ControlSessions::new();
        sessions.open_session(1);
        sessions.write(&service, 1, b"{\"command\":");
        assert!(sessions.read(1, 64).is_empty());
        sessions.write(&service, 1, b" \"frobnicate\"}\n");
        assert!(!sessions.read(1, 64).is_empty());
    }
}
