//! Process-IO Mediator, mirroring `process_io.py`.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};

use parking_lot::{Condvar, Mutex};

use crate::config::{ActionRule, OutputKind};
use crate::error::{Error, Result};

/// Which stream the mediator is draining from the child process.
enum ChildStream {
    Stdout(ChildStdout),
    Stderr(ChildStderr),
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ChildStream::Stdout(s) => s.read(buf),
            ChildStream::Stderr(s) => s.read(buf),
        }
    }
}

/// The two stream buffer flavors.
enum StreamBuffer {
    /// Pass-through pipe: reads block on the OS pipe itself.
    Pipe(ChildStream),
    /// In-memory byte ring used for `output=file` routing, where the
    /// mediator itself streams bytes the command wrote to `{temp}`.
    Memory { data: Vec<u8>, reset_pos: usize },
}

/// Result of one [`Mediator::read`] call.
pub struct StreamRead {
    /// Block index the stream position fell in when this read began.
    pub block: u64,
    /// Offset within that block.
    pub start: u64,
    /// Bytes read, or `None` if the process hasn't been started / produced
    /// nothing yet at a position the caller didn't ask for.
    pub data: Option<Vec<u8>>,
    /// Set when this read observed end-of-stream and the process has exited.
    pub process_exited: bool,
}

struct Inner {
    child: Option<Child>,
    buffer: Option<StreamBuffer>,
    write_open: bool,
    pid_auth: HashMap<u32, bool>,
    blocks_byte_pos: u64,
    read_active: bool,
    write_active: bool,
    temp_path: Option<PathBuf>,
}

/// Owns the spawned child command, its bounded stream buffer, and the
/// authorized-PID set.
pub struct Mediator {
    inner: Mutex<Inner>,
    cvar: Condvar,
}

impl Mediator {
    /// A freshly constructed, not-yet-started mediator.
    pub fn new() -> Self {
        Mediator {
            inner: Mutex::new(Inner {
                child: None,
                buffer: None,
                write_open: true,
                pid_auth: HashMap::new(),
                blocks_byte_pos: 0,
                read_active: false,
                write_active: false,
                temp_path: None,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Whether the child process has been spawned (running or exited but not
    /// yet cleaned up).
    pub fn is_running(&self) -> bool {
        self.inner.lock().child.is_some()
    }

    /// Re-arm the write-open flag when a new owner writer registers against
    /// an entry whose previous writer already closed (`CacheEntry.register_descriptor`).
    pub fn reopen_writes(&self) {
        self.inner.lock().write_open = true;
    }

    /// Idempotent process start. Builds `{input}`/`{output}`/`{output_base}`/
    /// `{temp}`/`{input_N}` substitutions, formats the command template, and
    /// spawns it, matching `ProcessIO.req_init`. No-ops if already running;
    /// the caller is responsible for not calling this once finalized.
    #[allow(clippy::too_many_arguments)]
    pub fn req_init(
        &self,
        rule: &ActionRule,
        input_mount: &Path,
        output_mount: &Path,
        match_groups: &[String],
        temp_path: &Path,
        internal_producer: Option<&dyn Fn(&Path) -> Result<()>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.child.is_some() {
            return Ok(());
        }

        inner.blocks_byte_pos = 0;
        inner.temp_path = Some(temp_path.to_path_buf());

        if let Some(producer) = internal_producer {
            producer(temp_path)?;
        }

        let mut replacements: HashMap<String, String> = HashMap::new();
        replacements.insert("input".to_string(), input_mount.to_string_lossy().to_string());
        replacements.insert("output".to_string(), output_mount.to_string_lossy().to_string());
        let output_str = output_mount.to_string_lossy().to_string();
        let output_base = output_str
            .strip_suffix(rule.ext.as_str())
            .unwrap_or(&output_str)
            .to_string();
        replacements.insert("output_base".to_string(), output_base);
        replacements.insert("temp".to_string(), temp_path.to_string_lossy().to_string());

        let input_dir = input_mount.parent().unwrap_or(Path::new("/"));
        for (idx, group) in match_groups.iter().enumerate() {
            replacements.insert(format!("input_{idx}"), input_dir.join(group).to_string_lossy().to_string());
        }

        let command = substitute(&rule.cmd, &replacements);
        let parts = shlex::split(&command)
            .ok_or_else(|| Error::ProtocolError(format!("unparsable command template: {command}")))?;
        if parts.is_empty() {
            return Err(Error::ProtocolError("empty command template".to_string()));
        }

        let stdout_dev = if rule.output == OutputKind::Stdout { Stdio::piped() } else { Stdio::null() };
        let stderr_dev = if rule.output == OutputKind::Stderr { Stdio::piped() } else { Stdio::null() };

        let mut child = Command::new(&parts[0])
            .args(&parts[1..])
            .stdout(stdout_dev)
            .stderr(stderr_dev)
            .spawn()?;

        inner.pid_auth.insert(child.id(), true);

        inner.buffer = Some(match rule.output {
            OutputKind::Stdout => StreamBuffer::Pipe(ChildStream::Stdout(child.stdout.take().unwrap())),
            OutputKind::Stderr => StreamBuffer::Pipe(ChildStream::Stderr(child.stderr.take().unwrap())),
            OutputKind::File => StreamBuffer::Memory {
                data: Vec::new(),
                reset_pos: 0,
            },
        });

        inner.child = Some(child);
        Ok(())
    }

    /// Perform a stream read if available, matching `ProcessIO.read`.
    /// `block_size` bounds how much is consumed per call.
    pub fn read(&self, req_block: u64, block_size: u64) -> Result<StreamRead> {
        let mut inner = self.inner.lock();
        while inner.read_active {
            self.cvar.wait(&mut inner);
        }
        inner.read_active = true;

        let result = (|| -> Result<StreamRead> {
            let process_block = inner.blocks_byte_pos / block_size;
            let process_start = inner.blocks_byte_pos % block_size;
            let mut data = None;
            let mut process_exited = false;

            let still_running = inner.child.is_some();
            if still_running && req_block >= process_block {
                let want = (block_size - process_start) as usize;
                let read_bytes = Self::read_buffer(&mut inner, &self.cvar, want)?;
                inner.blocks_byte_pos += read_bytes.len() as u64;

                if read_bytes.is_empty() {
                    if let Some(child) = inner.child.as_mut() {
                        if child.try_wait()?.is_some() {
                            process_exited = true;
                        }
                    }
                } else {
                    data = Some(read_bytes);
                }
            }

            Ok(StreamRead {
                block: process_block,
                start: process_start,
                data,
                process_exited,
            })
        })();

        inner.read_active = false;
        self.cvar.notify_all();
        result
    }

    fn read_buffer(inner: &mut Inner, cvar: &Condvar, size: usize) -> Result<Vec<u8>> {
        match inner.buffer.as_mut() {
            Some(StreamBuffer::Pipe(stream)) => {
                let mut buf = vec![0u8; size];
                let mut total = 0usize;
                while total < size {
                    let n = stream.read(&mut buf[total..])?;
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                buf.truncate(total);
                Ok(buf)
            }
            Some(StreamBuffer::Memory { .. }) => {
                // Block until the buffer holds at least one block or writers closed.
                loop {
                    let ready = {
                        let block_size_reached = match inner.buffer.as_ref() {
                            Some(StreamBuffer::Memory { data, .. }) => data.len() >= size,
                            _ => false,
                        };
                        block_size_reached || !inner.write_open
                    };
                    if ready {
                        break;
                    }
                    cvar.wait(inner);
                }

                if let Some(StreamBuffer::Memory { data, reset_pos }) = inner.buffer.as_mut() {
                    let end = (*reset_pos + size).min(data.len());
                    let out = data[*reset_pos..end].to_vec();
                    *reset_pos = end;

                    if *reset_pos == data.len() {
                        data.clear();
                        *reset_pos = 0;
                    }

                    Ok(out)
                } else {
                    Ok(Vec::new())
                }
            }
            None => Ok(Vec::new()),
        }
    }

    /// Write to the command's stdin-equivalent (the `file`-routed memory
    /// buffer; this crate never feeds a child's real stdin, matching the
    /// original's `output`-only routing) if `descriptor_pid` lies in the
    /// owner lineage; otherwise return `len(data)` unconsumed so the caller
    /// writes to the memory cache instead (`ProcessIO.write`).
    pub fn write(&self, data: &[u8], pos: u64, descriptor_pid: u32, block_size: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        while inner.write_active {
            self.cvar.wait(&mut inner);
        }
        inner.write_active = true;

        let result = (|| -> Result<usize> {
            if !self.context_owner_locked(&mut inner, descriptor_pid) {
                return Ok(data.len());
            }

            let mut ret_len = (inner.blocks_byte_pos as i64 - pos as i64).max(0) as usize;
            ret_len = ret_len.min(data.len());

            if ret_len < data.len() {
                let block_start = (inner.blocks_byte_pos / block_size) * block_size;
                let mut remain = data.len();
                let mut written_from = 0usize;

                if pos < inner.blocks_byte_pos {
                    remain -= (inner.blocks_byte_pos - pos) as usize;
                    written_from = (inner.blocks_byte_pos - pos) as usize;
                }

                let mut write_pos = if pos < inner.blocks_byte_pos {
                    0
                } else {
                    (pos - block_start) as usize
                };

                while remain > 0 {
                    let room = block_size as usize - write_pos;
                    let chunk = remain.min(room);
                    let slice = &data[written_from..written_from + chunk];
                    Self::write_buffer(&mut inner, &self.cvar, slice, block_size)?;
                    remain -= chunk;
                    written_from += chunk;
                    write_pos = (write_pos + chunk) % block_size as usize;
                }
            }

            Ok(ret_len)
        })();

        inner.write_active = false;
        self.cvar.notify_all();
        result
    }

    fn write_buffer(inner: &mut Inner, cvar: &Condvar, data: &[u8], block_size: u64) -> Result<()> {
        loop {
            let full = match inner.buffer.as_ref() {
                Some(StreamBuffer::Memory { data, .. }) => data.len() as u64 >= block_size,
                _ => false,
            };
            if !full {
                break;
            }
            cvar.wait(inner);
        }

        if let Some(StreamBuffer::Memory { data: buf, .. }) = inner.buffer.as_mut() {
            buf.extend_from_slice(data);
        }

        Ok(())
    }

    /// Truncate if absorbed by the stream buffer; `false` tells the caller
    /// to truncate its memory cache instead (`ProcessIO.truncate`).
    pub fn truncate(&self, pos: u64, descriptor_pid: u32, block_size: u64) -> bool {
        let mut inner = self.inner.lock();

        if !self.context_owner_locked(&mut inner, descriptor_pid) {
            return false;
        }

        if pos < inner.blocks_byte_pos {
            return false;
        }

        let block_start = (inner.blocks_byte_pos / block_size) * block_size;
        let mut trunc_remain = pos - block_start;

        match inner.buffer.as_mut() {
            Some(StreamBuffer::Memory { data, .. }) => {
                let current_len = data.len() as u64;
                if trunc_remain < current_len {
                    data.truncate(trunc_remain as usize);
                } else {
                    trunc_remain -= current_len;
                    data.extend(std::iter::repeat(0u8).take(trunc_remain as usize));
                }
                true
            }
            _ => true,
        }
    }

    /// Kill the child (if `end_reads`) and/or mark the write end closed (if
    /// `end_writes`), matching `ProcessIO.close`.
    pub fn close(&self, end_reads: bool, end_writes: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if end_reads {
            if let Some(mut child) = inner.child.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
            inner.write_open = false;
            inner.pid_auth.clear();
            if let Some(path) = inner.temp_path.take() {
                let _ = fs::remove_file(path);
            }
        }
        if end_writes {
            inner.write_open = false;
            self.cvar.notify_all();
        }
        Ok(())
    }

    /// Whether `pid` is authorized to write: its parent chain (or itself)
    /// must contain the spawned child's PID (`ProcessIO.context_owner` /
    /// `check_lineage`). Results are cached until the process ends.
    pub fn context_owner(&self, pid: u32) -> bool {
        let mut inner = self.inner.lock();
        self.context_owner_locked(&mut inner, pid)
    }

    fn context_owner_locked(&self, inner: &mut Inner, pid: u32) -> bool {
        let child_pid = match inner.child.as_ref() {
            Some(child) => child.id(),
            None => return false,
        };

        if let Some(&known) = inner.pid_auth.get(&pid) {
            return known;
        }

        let owned = is_descendant_of(pid, child_pid);
        inner.pid_auth.insert(pid, owned);
        owned
    }
}

impl Default for Mediator {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk `pid`'s parent chain via `/proc/<pid>/stat`, looking for `target`,
/// matching `ProcessIO.check_lineage`'s field-skip parsing of the
/// parenthesized (possibly space-containing) process name.
fn is_descendant_of(pid: u32, target: u32) -> bool {
    let mut current = pid;

    while current > 1 {
        if current == target {
            return true;
        }

        let stat = match fs::read_to_string(format!("/proc/{current}/stat")) {
            Ok(s) => s,
            Err(_) => return false,
        };

        let fields: Vec<&str> = stat.split(' ').collect();
        let mut field_mod = 0usize;
        for (idx, field) in fields.iter().enumerate().skip(1) {
            if field.ends_with(')') {
                field_mod = idx - 1;
                break;
            }
        }

        let parent_idx = 3 + field_mod;
        current = match fields.get(parent_idx).and_then(|s| s.parse().ok()) {
            Some(p) => p,
            None => return false,
        };
    }

    false
}

fn substitute(template: &str, replacements: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }

        let mut key = String::new();
        for next in chars.by_ref() {
            if next == '}' {
                break;
            }
            key.push(next);
        }

        match replacements.get(&key) {
            Some(value) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(&key);
                out.push('}');
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_fills_known_placeholders() {
        let mut replacements = HashMap::new();
        replacements.insert("input".to_string(), "/mnt/x.fastq".to_string());
        replacements.insert("output".to_string(), "/mnt/x.fastq+/x.fastq.fasta".to_string());

        let out = substitute("seqtk seq -A {input} > {output}", &replacements);
        assert_eq!(out, "seqtk seq -A /mnt/x.fastq > /mnt/x.fastq+/x.fastq.fasta");
    }

    #[test]
    fn req_init_spawns_and_reads_stdout() {
        let mediator = Mediator::new();
        let rule = ActionRule {
            matches: regex::Regex::new(".*").unwrap(),
            match_src: ".*".to_string(),
            ext: ".out".to_string(),
            cmd: "echo hello".to_string(),
            output: OutputKind::Stdout,
            append: None,
            disk_cache: true,
            init_size: 0,
            internal: vec![],
        };

        mediator
            .req_init(
                &rule,
                Path::new("/mnt/in"),
                Path::new("/mnt/out"),
                &[],
                Path::new("/tmp/doesnotmatter"),
                None,
            )
            .unwrap();

        let mut collected = Vec::new();
        loop {
            let read = mediator.read(0, 1024).unwrap();
            match read.data {
                Some(data) if !data.is_empty() => collected.extend(data),
                _ => break,
            }
        }
        assert_eq!(collected, b"hello\n");
    }

    #[test]
    fn non_owner_write_is_fully_rejected() {
        let mediator = Mediator::new();
        let rule = ActionRule {
            matches: regex::Regex::new(".*").unwrap(),
            match_src: ".*".to_string(),
            ext: ".out".to_string(),
            cmd: "cat".to_string(),
            output: OutputKind::Stdout,
            append: None,
            disk_cache: true,
            init_size: 0,
            internal: vec![],
        };
        mediator
            .req_init(&rule, Path::new("/mnt/in"), Path::new("/mnt/out"), &[], Path::new("/tmp/x"), None)
            .unwrap();

        // A pid that is not, and cannot be, in the child's lineage (pid 1 / init).
        let unconsumed = mediator.write(b"hello", 0, 1, 4096).unwrap();
        assert_eq!(unconsumed, 5);
    }
}
