//! Session-chain reconstruction and replay/verification, mirroring
//! `provenance/replication.py`.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use serde_json::Value;

use crate::error::{Error, Result};

use super::graph::ProcessKey;

/// One command in a replicated pipeline, with its stdio redirections
/// resolved (`Replication._build_command`/`_execute_chain`).
#[derive(Debug, Clone)]
pub struct ReplayCommand {
    pub process_id: ProcessKey,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub stdin_redirect: Option<String>,
    pub stdout_redirect: Option<(String, bool)>,
    pub stderr_redirect: Option<(String, bool)>,
    pub stdout_is_pipe: bool,
    pub stderr_is_pipe: bool,
    pub stderr_joins_stdout: bool,
}

fn process_object<'a>(graph: &'a Value, id: &str) -> Option<&'a Value> {
    graph["process"].as_object()?.get(id)
}

fn is_redirection(path: &str, mount: &str) -> bool {
    let check_abs = path.starts_with(mount);
    let check_rel = !(path.starts_with('/') || (path.contains(':') && !path.contains('/')));
    check_abs || check_rel
}

/// Walk pipe connections outward from `process_id` to find the full left-to-
/// right chain of piped commands it belongs to (`_build_chain`).
pub fn build_chain(graph: &Value, process_id: &str) -> Vec<String> {
    let processes = graph["process"].as_object().cloned().unwrap_or_default();

    let stdio = |id: &str, field: &str| -> String {
        processes.get(id).and_then(|p| p[field].as_str()).unwrap_or_default().to_string()
    };

    let mut left = process_id.to_string();
    loop {
        if !stdio(&left, "stdin").starts_with("pipe:") {
            break;
        }
        let current = left.clone();
        let target_stdin = stdio(&left, "stdin");

        let mut found = None;
        for candidate in processes.keys() {
            if *candidate == left {
                continue;
            }
            if stdio(candidate, "stdout") == target_stdin || stdio(candidate, "stderr") == target_stdin {
                found = Some(candidate.clone());
                break;
            }
        }

        match found {
            Some(next) => left = next,
            None => break,
        }

        if left == current {
            break;
        }
    }

    let mut chain = vec![left.clone()];
    let mut right = left;

    loop {
        let out_pipe = stdio(&right, "stdout").starts_with("pipe:");
        let err_pipe = stdio(&right, "stderr").starts_with("pipe:");
        if !out_pipe && !err_pipe {
            break;
        }

        let current = right.clone();
        let mut found = None;

        for candidate in processes.keys() {
            if *candidate == right {
                continue;
            }
            if !stdio(candidate, "stdin").starts_with("pipe:") {
                continue;
            }
            let candidate_stdin = stdio(candidate, "stdin");
            if candidate_stdin == stdio(&right, "stdout") || candidate_stdin == stdio(&right, "stderr") {
                found = Some(candidate.clone());
                break;
            }
        }

        match found {
            Some(next) => right = next,
            None => break,
        }

        if right == current {
            break;
        }

        chain.push(right.clone());
    }

    chain
}

/// Build the equivalent shell pipeline string for a chain, for the
/// `list_cmds` control action (`_build_command`).
pub fn build_command(graph: &Value, chain: &[String]) -> String {
    let mut commands = Vec::new();

    for process_id in chain {
        let process = match process_object(graph, process_id) {
            Some(p) => p,
            None => continue,
        };
        let cmd = process["cmd"].as_str().unwrap_or_default();
        let args: Vec<&str> = cmd.split('\0').filter(|s| !s.is_empty()).collect();

        let mut command = args.first().unwrap_or(&"").to_string();
        for arg in args.iter().skip(1) {
            if !arg.contains(' ') {
                command.push(' ');
                command.push_str(arg);
            } else if arg.contains('"') {
                command.push_str(&format!(" '{arg}'"));
            } else {
                command.push_str(&format!(" \"{arg}\""));
            }
        }
        commands.push(command);
    }

    let mut pipeline = commands.join(" | ");

    if let (Some(first), Some(last)) = (chain.first(), chain.last()) {
        if let Some(first_proc) = process_object(graph, first) {
            let stdin = first_proc["stdin"].as_str().unwrap_or_default();
            if stdin.starts_with('/') || (!stdin.starts_with("pipe:") && !stdin.is_empty()) {
                pipeline.push_str(&format!(" < {stdin}"));
            }
        }
        if let Some(last_proc) = process_object(graph, last) {
            for (stream, field) in [("stdout", "trunc_stdout"), ("stderr", "trunc_stderr")] {
                let target = last_proc[stream].as_str().unwrap_or_default();
                if target.starts_with('/') || (!target.starts_with("pipe:") && !target.is_empty()) {
                    let trunc = last_proc[field].as_bool().unwrap_or(false);
                    let operator = if trunc { ">" } else { ">>" };
                    pipeline.push_str(&format!(" {operator} {target}"));
                }
            }
        }
    }

    pipeline
}

/// Group a graph's recorded processes into the ordered list of piped command
/// chains rooted at session leaders (`get_session_chains`).
pub fn session_chains(graph: &Value, expand: &HashSet<String>, filter_expanded: bool) -> Vec<Vec<String>> {
    let processes = graph["process"].as_object().cloned().unwrap_or_default();
    let sessions = graph["session"].as_object().cloned().unwrap_or_default();

    let mut potential_leaders: HashSet<String> = sessions.keys().cloned().collect();
    let mut expand_remain = potential_leaders.clone();
    expand_remain.extend(expand.iter().cloned());
    let mut session_children: HashSet<String> = HashSet::new();

    loop {
        let expand_current: HashSet<String> = expand_remain.intersection(&potential_leaders).cloned().collect();
        if expand_current.is_empty() {
            break;
        }

        for (id, info) in &processes {
            let parent_id = format!(
                "{}|{}|{}",
                info["phost"].as_str().unwrap_or_default(),
                info["parent_start"].as_f64().unwrap_or_default(),
                info["parent_pid"].as_u64().unwrap_or_default(),
            );

            if expand_current.contains(&parent_id) {
                let is_leader = (info["pstart"].as_f64(), info["pid"].as_u64())
                    == (info["tgid_start"].as_f64(), info["tgid"].as_u64());

                if is_leader {
                    potential_leaders.insert(id.clone());
                    session_children.insert(id.clone());
                    if filter_expanded {
                        session_children.remove(&parent_id);
                    }
                }

                expand_remain.remove(&parent_id);
            }
        }
    }

    let mut chains: Vec<Vec<String>> = session_children.iter().map(|id| build_chain(graph, id)).collect();

    chains.sort_by(|a, b| {
        let start_a = a.first().and_then(|id| processes.get(id)).and_then(|p| p["pstart"].as_f64()).unwrap_or(0.0);
        let start_b = b.first().and_then(|id| processes.get(id)).and_then(|p| p["pstart"].as_f64()).unwrap_or(0.0);
        start_a.partial_cmp(&start_b).unwrap_or(std::cmp::Ordering::Equal)
    });

    chains
}

/// Execute one reconstructed pipeline chain against the mounted filesystem,
/// piping stdio between stages (`_execute_chain`). Returns the chain's raw
/// stdout/stderr for non-redirected final stages, for the control endpoint
/// to stream back to the caller.
pub fn execute_chain(graph: &Value, chain: &[String], mount: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let commands: Vec<(String, Value)> = chain
        .iter()
        .filter_map(|id| process_object(graph, id).map(|p| (id.clone(), p.clone())))
        .collect();

    if commands.is_empty() {
        return Err(Error::ReplayWarning("empty replay chain".to_string()));
    }

    let mut children = Vec::new();
    let mut prev_stdout: Option<std::process::ChildStdout> = None;

    for (idx, (_, process)) in commands.iter().enumerate() {
        let cmd = process["cmd"].as_str().unwrap_or_default();
        let args: Vec<String> = cmd.split('\0').filter(|s| !s.is_empty()).map(|s| s.replace("$$$", mount)).collect();
        if args.is_empty() {
            continue;
        }

        let cwd = process["cwd"]["rel_mount"].as_str().map(|rel| Path::new(mount).join(rel).to_string_lossy().to_string());

        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        if let Some(cwd) = &cwd {
            command.current_dir(cwd);
        }

        if idx == 0 {
            let stdin_target = process["stdin"].as_str().unwrap_or_default();
            if is_redirection(stdin_target, mount) {
                command.stdin(Stdio::from(std::fs::File::open(stdin_target.replace("$$$", mount))?));
            } else {
                command.stdin(Stdio::null());
            }
        } else if let Some(stdout) = prev_stdout.take() {
            command.stdin(Stdio::from(stdout));
        }

        let is_last = idx + 1 == commands.len();
        if is_last {
            let stdout_target = process["stdout"].as_str().unwrap_or_default();
            if is_redirection(stdout_target, mount) {
                let trunc = process["trunc_stdout"].as_bool().unwrap_or(false);
                let file = open_redirect(&stdout_target.replace("$$$", mount), trunc)?;
                command.stdout(Stdio::from(file));
            } else {
                command.stdout(Stdio::piped());
            }

            let stderr_target = process["stderr"].as_str().unwrap_or_default();
            if is_redirection(stderr_target, mount) {
                let trunc = process["trunc_stderr"].as_bool().unwrap_or(false);
                let file = open_redirect(&stderr_target.replace("$$$", mount), trunc)?;
                command.stderr(Stdio::from(file));
            } else {
                command.stderr(Stdio::piped());
            }
        } else {
            command.stdout(Stdio::piped());
            command.stderr(Stdio::inherit());
        }

        let mut child = command.spawn().map_err(Error::IoError)?;
        prev_stdout = child.stdout.take();
        children.push(child);
    }

    let mut last = children.pop().ok_or_else(|| Error::ReplayWarning("no processes spawned".to_string()))?;
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    if let Some(mut out) = last.stdout.take() {
        out.read_to_end(&mut stdout_buf).ok();
    }
    if let Some(mut err) = last.stderr.take() {
        err.read_to_end(&mut stderr_buf).ok();
    }
    last.wait().map_err(Error::IoError)?;

    for mut child in children {
        child.wait().map_err(Error::IoError)?;
    }

    Ok((stdout_buf, stderr_buf))
}

fn open_redirect(path: &str, truncate: bool) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(truncate)
        .append(!truncate)
        .open(path)
        .map_err(Error::IoError)
}

/// Compare the hash recorded for `orig` against the hash recorded in a
/// freshly-built replay graph for the process it mapped to
/// (`_verify_execution`'s checksum check).
pub fn verify_hash_match(orig_graph: &Value, orig_id: &str, repl_graph: &Value, repl_id: &str) -> bool {
    let orig_hash = process_object(orig_graph, orig_id).and_then(|p| p["hash"].as_str()).unwrap_or_default();
    let repl_hash = process_object(repl_graph, repl_id).and_then(|p| p["hash"].as_str()).unwrap_or_default();
    orig_hash == repl_hash
}

/// Match a process's children between the original and replicated
/// provenance by executable basename and order (`_verify_child_match`).
pub fn verify_child_match(orig_graph: &Value, orig_id: &str, repl_graph: &Value, repl_id: &str) -> Option<Vec<(String, String)>> {
    let children_of = |graph: &Value, id: &str| -> Vec<String> {
        let mut out: Vec<String> = graph["process"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter(|(_, p)| {
                        format!(
                            "{}|{}|{}",
                            p["phost"].as_str().unwrap_or_default(),
                            p["parent_start"].as_f64().unwrap_or_default(),
                            p["parent_pid"].as_u64().unwrap_or_default(),
                        ) == id
                    })
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    };

    let orig_children = children_of(orig_graph, orig_id);
    let repl_children = children_of(repl_graph, repl_id);

    if orig_children.len() != repl_children.len() {
        return None;
    }

    let mut mapping = Vec::new();
    for (orig_child, repl_child) in orig_children.iter().zip(repl_children.iter()) {
        let orig_exe = process_object(orig_graph, orig_child).and_then(|p| p["exe"].as_str()).unwrap_or_default();
        let repl_exe = process_object(repl_graph, repl_child).and_then(|p| p["exe"].as_str()).unwrap_or_default();

        let orig_base = orig_exe.rsplit('/').next().unwrap_or_default();
        let repl_base = repl_exe.rsplit('/').next().unwrap_or_default();
        if orig_base != repl_base {
            return None;
        }

        mapping.push((orig_child.clone(), repl_child.clone()));
    }

    Some(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_graph() -> Value {
        json!({
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
        })
    }

    #[test]
    fn single_process_chain_has_one_member() {
        let graph = sample_graph();
        let chain = build_chain(&graph, "h|1|10");
        assert_eq!(chain, vec!["h|1|10".to_string()]);
    }

    #[test]
    fn builds_readable_command_with_redirection() {
        let graph = sample_graph();
        let chain = build_chain(&graph, "h|1|10");
        let command = build_command(&graph, &chain);
        assert!(command.starts_with("cat in.txt"));
        assert!(command.contains("< in.txt"));
        assert!(command.contains("> out.txt"));
    }

    #[test]
    fn session_chains_finds_the_single_leader() {
        let graph = sample_graph();
        let chains = session_chains(&graph, &HashSet::new(), true);
        assert_eq!(chains.len(), 1);
    }
}
