//! File Identity Resolver: classifies paths into real files, virtual derived
//! files, the control endpoint, and pipe endpoints, mirroring `file_entry.py`.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;

/// How the path handed to [`Resolver::resolve`] was originally expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrigType {
    /// A path relative to the mount root.
    Relative,
    /// An absolute path inside the virtual mount namespace that didn't match
    /// either real root or mount prefix textually.
    AbsVirt,
    /// An absolute path under the real backing root.
    AbsReal,
    /// An absolute path under the mount point.
    AbsMount,
}

/// The four path spellings every file identity carries simultaneously.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Path relative to root/mount, with no leading separator.
    pub relative: String,
    /// Absolute path in the real backing filesystem.
    pub abs_real: PathBuf,
    /// Absolute path as seen through the FUSE mount.
    pub abs_mount: PathBuf,
    /// Absolute path in virtual (mount-root-relative) notation.
    pub abs_virt: PathBuf,
    /// How the original path argument was classified.
    pub orig_type: OrigType,
}

impl Paths {
    /// Build absolute and relative (to root/mount) path variants for `path`,
    /// mirroring `FileEntry.get_paths`.
    pub fn compute(path: &str, root: &Path, mount: &Path) -> Paths {
        let root_term = format!("{}/", root.display());
        let mount_term = format!("{}/", mount.display());

        let mut relative = path.to_string();
        if !relative.ends_with('/') {
            relative.push('/');
        }
        let mut orig_type = OrigType::Relative;

        if relative.starts_with('/') {
            orig_type = OrigType::AbsVirt;

            if relative.starts_with(&root_term) {
                relative = relative[root_term.len()..].to_string();
                orig_type = OrigType::AbsReal;
            }

            if relative.starts_with(&mount_term) {
                relative = relative[mount_term.len()..].to_string();
                orig_type = OrigType::AbsMount;
            }
        }

        let (abs_real, abs_mount, abs_virt) = if relative.contains(':') {
            // Non-disk paths (pipes) use the relative form as-is everywhere.
            (
                PathBuf::from(&relative),
                PathBuf::from(&relative),
                PathBuf::from(&relative),
            )
        } else {
            (
                root.join(&relative),
                mount.join(&relative),
                Path::new("/").join(&relative),
            )
        };

        Paths {
            relative: relative.trim_end_matches('/').to_string(),
            abs_real: trim_trailing_slash(abs_real),
            abs_mount: trim_trailing_slash(abs_mount),
            abs_virt: trim_trailing_slash(abs_virt),
            orig_type,
        }
    }
}

fn trim_trailing_slash(path: PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    if s.len() > 1 && s.ends_with('/') {
        PathBuf::from(s.trim_end_matches('/'))
    } else {
        path
    }
}

/// Classification of a resolved file identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A real, pre-existing backing file/dir/symlink.
    Real,
    /// A virtual derived file.
    Vdf,
    /// The control pseudo-file.
    Control,
    /// A shared pipe endpoint.
    Pipe,
}

/// One action this identity's basename could produce, recorded with its
/// regex capture groups (`derived_actions` in the original).
#[derive(Debug, Clone)]
pub struct DerivedAction {
    /// Action rule key (`match`, `ext`).
    pub key: (String, String),
    /// Capture groups from matching the rule's regex against the basename.
    pub groups: Vec<String>,
}

/// File Identity: the resolved, typed view of a path.
#[derive(Debug, Clone)]
pub struct FileIdentity {
    /// The four path spellings.
    pub paths: Paths,
    /// Classification.
    pub kind: Kind,
    /// Whether this identity resolved to something usable at all.
    pub valid: bool,
    /// True for directories (real or VDF suffix directories).
    pub is_dir: bool,
    /// mtime inherited from the backing file, or from the derived parent.
    pub mtime: f64,
    /// Declared size before the first byte is known.
    pub init_size: u64,
    /// If this is a VDF, the parent identity it derives from.
    pub derived_source: Option<Arc<FileIdentity>>,
    /// If this is a VDF, the action rule + capture groups that produced it.
    pub virt_action: Option<DerivedAction>,
    /// All actions this identity's basename (or, for VDF dirs, its target's
    /// basename) could produce, keyed by the produced basename.
    pub derived_actions: HashMap<String, DerivedAction>,
}

/// Resolves paths against a root/mount pair and a configuration's action
/// rules.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
    mount: PathBuf,
    config: Arc<Config>,
}

impl Resolver {
    /// Build a resolver bound to a concrete root/mount pair.
    pub fn new(root: PathBuf, mount: PathBuf, config: Arc<Config>) -> Self {
        Resolver { root, mount, config }
    }

    /// Resolve `path` to a [`FileIdentity`], recursing into `derived_source`
    /// for VDF paths the way `FileEntry::_build_entry` does.
    pub fn resolve(&self, path: &str) -> FileIdentity {
        let paths = Paths::compute(path.trim_start_matches('/'), &self.root, &self.mount);

        let control_file = Path::new("/").join(&self.config.api);
        if paths.abs_virt.ends_with(&control_file) || paths.abs_virt == control_file {
            return FileIdentity {
                paths,
                kind: Kind::Control,
                valid: true,
                is_dir: false,
                mtime: 0.0,
                init_size: self.config.api_size,
                derived_source: None,
                virt_action: None,
                derived_actions: HashMap::new(),
            };
        }

        if paths.relative.starts_with("pipe:") {
            return FileIdentity {
                paths,
                kind: Kind::Pipe,
                valid: true,
                is_dir: false,
                mtime: 0.0,
                init_size: 0,
                derived_source: None,
                virt_action: None,
                derived_actions: HashMap::new(),
            };
        }

        self.build_entry(paths)
    }

    fn build_entry(&self, paths: Paths) -> FileIdentity {
        if let Ok(meta) = fs::symlink_metadata(&paths.abs_real) {
            let is_dir = meta.is_dir();
            let mtime = meta.mtime() as f64 + meta.mtime_nsec() as f64 / 1e9;
            let derived_actions = self.populate_actions(&paths, None, is_dir);

            return FileIdentity {
                paths,
                kind: Kind::Real,
                valid: true,
                is_dir,
                mtime,
                init_size: 0,
                derived_source: None,
                virt_action: None,
                derived_actions,
            };
        }

        let virt_dir = paths.abs_virt.parent().unwrap_or(Path::new("/")).to_path_buf();
        let virt_base = basename(&paths.abs_virt);

        let (source_dir, is_dir) = if virt_base.ends_with(self.config.suffix.as_str()) {
            (paths.abs_virt.clone(), true)
        } else if virt_dir
            .to_string_lossy()
            .ends_with(self.config.suffix.as_str())
        {
            (virt_dir.clone(), false)
        } else {
            return invalid(paths);
        };

        let source_base = basename(&source_dir);
        if self.config.hidden && !source_base.starts_with('.') {
            return invalid(paths);
        }

        let mut source_path_str = source_dir.to_string_lossy().to_string();
        source_path_str.truncate(source_path_str.len() - self.config.suffix.len());

        if self.config.hidden {
            let parent = Path::new(&source_path_str).parent().unwrap_or(Path::new("/"));
            let base = basename(Path::new(&source_path_str));
            let stripped = base.strip_prefix('.').unwrap_or(&base).to_string();
            source_path_str = parent.join(stripped).to_string_lossy().to_string();
        }

        let source_identity = self.resolve(&source_path_str);
        if !source_identity.valid
            || (source_identity.derived_source.is_some() && !source_identity.is_dir_and_reg())
        {
            return invalid(paths);
        }

        let source_identity = Arc::new(source_identity);

        let mut init_size = 0;
        if !is_dir {
            let action = match source_identity.derived_actions.get(&virt_base) {
                Some(a) => a.clone(),
                None => return invalid(paths),
            };

            init_size = self
                .config
                .actions
                .get(&action.key)
                .map(|rule| rule.init_size)
                .unwrap_or(0);

            let mtime = source_identity.mtime;
            let derived_actions = self.populate_actions(&paths, Some(&source_identity), false);

            return FileIdentity {
                paths,
                kind: Kind::Vdf,
                valid: true,
                is_dir: false,
                mtime,
                init_size,
                derived_source: Some(source_identity),
                virt_action: Some(action),
                derived_actions,
            };
        }

        let mtime = source_identity.mtime;
        let derived_actions = self.populate_actions(&paths, Some(&source_identity), true);

        FileIdentity {
            paths,
            kind: Kind::Vdf,
            valid: true,
            is_dir: true,
            mtime,
            init_size,
            derived_source: Some(source_identity),
            virt_action: None,
            derived_actions,
        }
    }

    /// Populate `derived_actions`: for real files/dirs and regular VDFs this
    /// is keyed off the identity's own basename; for VDF *directories* it is
    /// keyed off the target (derived-source) basename, matching
    /// `FileEntry._populate_actions`.
    fn populate_actions(
        &self,
        paths: &Paths,
        derived_source: Option<&Arc<FileIdentity>>,
        is_dir: bool,
    ) -> HashMap<String, DerivedAction> {
        let mut out = HashMap::new();
        let virt_base = basename(&paths.abs_virt);

        let current_base = if derived_source.is_none() || !is_dir {
            virt_base
        } else {
            basename(&derived_source.unwrap().paths.abs_virt)
        };

        for rule in self.config.actions.values() {
            if let Some(captures) = rule.matches.captures(&current_base) {
                let groups: Vec<String> = captures
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                    .collect();
                let action_name = format!("{current_base}{}", rule.ext);
                out.insert(
                    action_name,
                    DerivedAction {
                        key: rule.key(),
                        groups,
                    },
                );
            }
        }

        out
    }
}

impl FileIdentity {
    fn is_dir_and_reg(&self) -> bool {
        // A derived_source that is itself derived must be a regular file
        // (not a VDF directory) to be a legal parent, per the original.
        !self.is_dir
    }
}

fn invalid(paths: Paths) -> FileIdentity {
    FileIdentity {
        paths,
        kind: Kind::Real,
        valid: false,
        is_dir: false,
        mtime: 0.0,
        init_size: 0,
        derived_source: None,
        virt_action: None,
        derived_actions: HashMap::new(),
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs as stdfs;

    fn test_config(root: &Path) -> Arc<Config> {
        stdfs::write(
            root.join("repeatfs.conf"),
            "[entry]\nmatch=\\.fastq$\next=.fasta\ncmd=cat {input}\noutput=stdout\n",
        )
        .unwrap();
        Arc::new(Config::load(root).unwrap())
    }

    #[test]
    fn resolves_real_file() {
        let root = tempfile::tempdir().unwrap();
        let mount = tempfile::tempdir().unwrap();
        stdfs::write(root.path().join("x.fastq"), b"@r\nACGT\n+\nIIII\n").unwrap();

        let config = test_config(root.path());
        let resolver = Resolver::new(root.path().to_path_buf(), mount.path().to_path_buf(), config);

        let identity = resolver.resolve("x.fastq");
        assert!(identity.valid);
        assert_eq!(identity.kind, Kind::Real);
        assert!(identity.derived_actions.contains_key("x.fastq.fasta"));
    }

    #[test]
    fn resolves_vdf_under_suffix_dir() {
        let root = tempfile::tempdir().unwrap();
        let mount = tempfile::tempdir().unwrap();
        stdfs::write(root.path().join("x.fastq"), b"@r\nACGT\n+\nIIII\n").unwrap();

        let config = test_config(root.path());
        let resolver = Resolver::new(root.path().to_path_buf(), mount.path().to_path_buf(), config);

        let identity = resolver.resolve("x.fastq+/x.fastq.fasta");
        assert!(identity.valid);
        assert_eq!(identity.kind, Kind::Vdf);
        assert!(identity.derived_source.is_some());
        assert!(identity.virt_action.is_some());
    }

    #[test]
    fn rejects_unmatched_derived_path() {
        let root = tempfile::tempdir().unwrap();
        let mount = tempfile::tempdir().unwrap();
        stdfs::write(root.path().join("x.fastq"), b"data").unwrap();

        let config = test_config(root.path());
        let resolver = Resolver::new(root.path().to_path_buf(), mount.path().to_path_buf(), config);

        let identity = resolver.resolve("x.fastq+/nonsense.bin");
        assert!(!identity.valid);
    }
}
