//! Line-oriented configuration format plus per-entry action rules, matching
//! `configuration.py`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{Error, Result};

/// Where a VDF-producing command's output is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutputKind {
    /// Read the child's stdout.
    Stdout,
    /// Read the child's stderr.
    Stderr,
    /// The command writes to `{temp}` itself; the mediator streams that file.
    File,
}

impl OutputKind {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "stdout" => Ok(OutputKind::Stdout),
            "stderr" => Ok(OutputKind::Stderr),
            "file" => Ok(OutputKind::File),
            other => Err(Error::ProtocolError(format!("invalid output kind '{other}'"))),
        }
    }
}

/// One `[entry]` block: a regex over basenames, the extension it produces,
/// and the command template used to produce it.
#[derive(Debug, Clone)]
pub struct ActionRule {
    /// Source regex, matched against a candidate basename.
    pub matches: Regex,
    /// Raw source of `matches`, kept because `(match, ext)` is the action key.
    pub match_src: String,
    /// Extension appended to the matched basename to name the VDF.
    pub ext: String,
    /// Command template; placeholders are substituted at spawn time.
    pub cmd: String,
    /// Which stream carries the command's output.
    pub output: OutputKind,
    /// Declared but unused by any operation; carried for
    /// configuration-surface fidelity only.
    pub append: Option<String>,
    /// Same status as `append`.
    pub disk_cache: bool,
    /// Declared size reported before the first byte is known.
    pub init_size: u64,
    /// `internal=<name>` registry keys consulted before spawning `cmd`.
    pub internal: Vec<String>,
}

impl ActionRule {
    /// The `(match, ext)` pair that uniquely keys an action rule.
    pub fn key(&self) -> (String, String) {
        (self.match_src.clone(), self.ext.clone())
    }
}

/// Global + per-entry configuration, parsed from `repeatfs.conf`.
#[derive(Debug, Clone)]
pub struct Config {
    /// VDF directory suffix (default `+`).
    pub suffix: String,
    /// Prepend `.` to VDF paths.
    pub hidden: bool,
    /// Hide VDF directories from listing.
    pub invisible: bool,
    /// Cache block size in bytes.
    pub block_size: u64,
    /// Total in-memory cache budget in bytes.
    pub store_size: u64,
    /// Reader-priority wait timeout, in seconds.
    pub read_timeout: f64,
    /// Directory holding disk-overflow files.
    pub cache_path: PathBuf,
    /// Provenance causality tolerance, in seconds.
    pub io_epsilon: f64,
    /// Control pseudo-file name.
    pub api: String,
    /// Reported size of the control pseudo-file.
    pub api_size: u64,
    /// Action rules, keyed by `(match, ext)`.
    pub actions: HashMap<(String, String), ActionRule>,
}

const CONFIG_FILE: &str = "repeatfs.conf";

impl Config {
    fn defaults() -> Self {
        Config {
            suffix: "+".to_string(),
            hidden: false,
            invisible: true,
            block_size: 1_048_576,
            store_size: 1_073_741_824,
            read_timeout: 1.0,
            cache_path: PathBuf::from("/tmp/repeatfs.cache"),
            io_epsilon: 7.0,
            api: ".repeatfs-api".to_string(),
            api_size: 1_048_576,
            actions: HashMap::new(),
        }
    }

    /// Load `<dir>/repeatfs.conf`, registering the always-on system entries
    /// (provenance JSON rendering) in addition to anything the file defines.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let contents = fs::read_to_string(&path).map_err(|_| {
            Error::NotFound(format!(
                "configuration file not found at {}; run 'repeatfs generate' first",
                path.display()
            ))
        })?;

        let mut config = Config::defaults();
        let mut pending: HashMap<String, String> = HashMap::new();
        let mut entry_mode = false;
        let mut line_num = 0usize;

        let global_re = Regex::new(r"^[ \t]*(#.*)?$").unwrap();
        let entry_header_re = Regex::new(r"^[ \t]*\[entry\][ \t]*(#.*)?$").unwrap();
        let field_re = Regex::new(r"^[ \t]*([^= \t]+)[ \t]*=[ \t]*([^#]+?)[ \t]*(#.*)?$").unwrap();

        for raw_line in contents.lines() {
            line_num += 1;
            let line = raw_line.trim_end();

            if global_re.is_match(line) {
                continue;
            }

            if entry_header_re.is_match(line) {
                if !pending.is_empty() || entry_mode {
                    config.add_entry(entry_mode, std::mem::take(&mut pending), line_num)?;
                }
                entry_mode = true;
                continue;
            }

            let captures = field_re
                .captures(line)
                .ok_or_else(|| Error::ProtocolError(format!("invalid configuration line ({line_num})")))?;
            let field = captures.get(1).unwrap().as_str().to_string();
            let value = captures.get(2).unwrap().as_str().trim().to_string();

            if !is_known_field(&field) {
                return Err(Error::ProtocolError(format!("invalid configuration line ({line_num})")));
            }
            if entry_mode && !is_entry_field(&field) {
                return Err(Error::ProtocolError(format!(
                    "global attribute '{field}' in entry section ({line_num})"
                )));
            }
            if !entry_mode && is_entry_field(&field) {
                return Err(Error::ProtocolError(format!(
                    "entry attribute '{field}' in global section ({line_num})"
                )));
            }

            pending.insert(field, value);
        }

        if !pending.is_empty() || entry_mode {
            config.add_entry(entry_mode, pending, line_num)?;
        }

        config.register_system_entries()?;

        Ok(config)
    }

    fn add_entry(&mut self, entry_mode: bool, values: HashMap<String, String>, line_num: usize) -> Result<()> {
        if entry_mode {
            let matches_src = values
                .get("match")
                .ok_or_else(|| Error::ProtocolError(format!("required field 'match' missing ({line_num})")))?
                .clone();
            let ext = values
                .get("ext")
                .ok_or_else(|| Error::ProtocolError(format!("required field 'ext' missing ({line_num})")))?
                .clone();
            let cmd = values
                .get("cmd")
                .ok_or_else(|| Error::ProtocolError(format!("required field 'cmd' missing ({line_num})")))?
                .clone();
            let output = OutputKind::parse(values.get("output").map(String::as_str).unwrap_or("stdout"))?;

            if output != OutputKind::File && cmd.contains("{output}") {
                return Err(Error::ProtocolError(
                    "'{output}' command variable only valid for 'file' output".to_string(),
                ));
            }

            let regex = Regex::new(&matches_src)
                .map_err(|e| Error::ProtocolError(format!("invalid match regex '{matches_src}': {e}")))?;

            let rule = ActionRule {
                matches: regex,
                match_src: matches_src,
                ext,
                cmd,
                output,
                append: values.get("append").cloned(),
                disk_cache: values.get("disk_cache").map(|v| v == "True" || v == "true").unwrap_or(true),
                init_size: values.get("init_size").and_then(|v| v.parse().ok()).unwrap_or(0),
                internal: values
                    .get("internal")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
            };

            self.actions.insert(rule.key(), rule);
        } else {
            for (field, value) in values {
                self.set_global(&field, &value)?;
            }
        }

        Ok(())
    }

    fn set_global(&mut self, field: &str, value: &str) -> Result<()> {
        match field {
            "suffix" => self.suffix = value.to_string(),
            "hidden" => self.hidden = value.eq_ignore_ascii_case("true"),
            "invisible" => self.invisible = value.eq_ignore_ascii_case("true"),
            "block_size" => {
                self.block_size = value
                    .parse()
                    .map_err(|_| Error::ProtocolError(format!("invalid block_size '{value}'")))?
            }
            "store_size" => {
                self.store_size = value
                    .parse()
                    .map_err(|_| Error::ProtocolError(format!("invalid store_size '{value}'")))?
            }
            "read_timeout" => {
                self.read_timeout = value
                    .parse()
                    .map_err(|_| Error::ProtocolError(format!("invalid read_timeout '{value}'")))?
            }
            "cache_path" => self.cache_path = PathBuf::from(shellexpand_home(value)),
            "io_epsilon" => {
                self.io_epsilon = value
                    .parse()
                    .map_err(|_| Error::ProtocolError(format!("invalid io_epsilon '{value}'")))?
            }
            "api" => self.api = value.to_string(),
            "api_size" => {
                self.api_size = value
                    .parse()
                    .map_err(|_| Error::ProtocolError(format!("invalid api_size '{value}'")))?
            }
            other => return Err(Error::ProtocolError(format!("unknown global field '{other}'"))),
        }

        Ok(())
    }

    /// Register the always-on system action rules producing `*.provenance.json`.
    /// `*.provenance.html` Graphviz rendering is out of scope.
    fn register_system_entries(&mut self) -> Result<()> {
        let rule = ActionRule {
            matches: Regex::new(".*").unwrap(),
            match_src: ".*".to_string(),
            ext: ".provenance.json".to_string(),
            cmd: "cat {temp}".to_string(),
            output: OutputKind::Stdout,
            append: None,
            disk_cache: true,
            init_size: 0,
            internal: vec!["provenance_json".to_string()],
        };
        self.actions.insert(rule.key(), rule);

        Ok(())
    }

    /// Look up the cache directory ensuring it exists.
    pub fn ensure_cache_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.cache_path)?;
        Ok(())
    }
}

fn shellexpand_home(value: &str) -> String {
    if let Some(rest) = value.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}{rest}");
        }
    }
    value.to_string()
}

fn is_known_field(field: &str) -> bool {
    matches!(
        field,
        "suffix"
            | "hidden"
            | "invisible"
            | "block_size"
            | "store_size"
            | "read_timeout"
            | "cache_path"
            | "io_epsilon"
            | "api"
            | "api_size"
            | "match"
            | "ext"
            | "cmd"
            | "output"
            | "append"
            | "disk_cache"
            | "init_size"
            | "internal"
    )
}

fn is_entry_field(field: &str) -> bool {
    matches!(
        field,
        "match" | "ext" | "cmd" | "output" | "append" | "disk_cache" | "init_size" | "internal"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_globals_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "block_size=4096\nstore_size=8192\n\n[entry]\nmatch=\\.fastq$\next=.fasta\ncmd=seqtk seq -A {input}\noutput=stdout\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.store_size, 8192);
        assert!(config.actions.contains_key(&("\\.fastq$".to_string(), ".fasta".to_string())));
        // System entry is always registered alongside user entries.
        assert!(config.actions.contains_key(&(".*".to_string(), ".provenance.json".to_string())));
    }

    #[test]
    fn rejects_output_variable_without_file_output() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[entry]\nmatch=x\next=.y\ncmd=echo {output}\noutput=stdout\n",
        )
        .unwrap();

        assert!(Config::load(dir.path()).is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
