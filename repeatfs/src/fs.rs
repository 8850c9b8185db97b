//! `fuser::Filesystem` glue, mirroring `core.py`'s dispatch surface in the
//! idiom of `fuser`'s own default-impl style in `lib.rs` and its
//! `passthrough.rs` pattern. Bridges the kernel's
//! inode-keyed calls onto the path-keyed [`crate::identity::Resolver`] and
//! the rest of the engine with a small self-maintained inode table, since a
//! full kernel-facing inode-cache adapter is out of scope.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, INodeNo, KernelConfig, OpenFlags,
    ReadFlags, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyStatfs, ReplyWrite, Request, WriteFlags,
};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::cache::{IoOutcome, Operation};
use crate::descriptor::{Descriptor, DescriptorId};
use crate::error::Error;
use crate::identity::{FileIdentity, Kind};
use crate::provenance::OpKind;
use crate::Service;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

fn f64_to_systemtime(secs: f64) -> SystemTime {
    if secs <= 0.0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_secs_f64(secs)
}

/// The self-maintained inode <-> relative-path table bridging the kernel's
/// inode-keyed calls onto [`crate::identity::Resolver`]'s path-keyed API.
struct Inodes {
    next: u64,
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
}

impl Inodes {
    fn new() -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, String::new());
        by_path.insert(String::new(), ROOT_INO);
        Inodes {
            next: 2,
            by_ino,
            by_path,
        }
    }

    fn ino_for(&mut self, relative: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(relative) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(relative.to_string(), ino);
        self.by_ino.insert(ino, relative.to_string());
        ino
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }

    fn retarget(&mut self, old_relative: &str, new_relative: &str) {
        if let Some(ino) = self.by_path.remove(old_relative) {
            self.by_path.insert(new_relative.to_string(), ino);
            self.by_ino.insert(ino, new_relative.to_string());
        }
    }
}

/// The `Filesystem` implementation itself: thin inode bookkeeping in front
/// of the [`Service`] that does the real work.
pub struct RepeatFs {
    service: Arc<Service>,
    inodes: Mutex<Inodes>,
}

impl RepeatFs {
    /// Build the filesystem glue around an already-constructed service.
    pub fn new(service: Arc<Service>) -> Self {
        RepeatFs {
            service,
            inodes: Mutex::new(Inodes::new()),
        }
    }

    fn resolve_ino(&self, ino: INodeNo) -> Result<(String, FileIdentity), Errno> {
        let relative = self.inodes.lock().path_for(ino.0).ok_or(Errno::ENOENT)?;
        let identity = self.service.resolver.resolve(&relative);
        if !identity.valid && relative.is_empty() {
            // Root always resolves even if the backing directory listing is empty.
        } else if !identity.valid {
            return Err(Errno::ENOENT);
        }
        Ok((relative, identity))
    }

    fn child_path(&self, parent_relative: &str, name: &OsStr) -> String {
        let name = name.to_string_lossy();
        if parent_relative.is_empty() {
            name.to_string()
        } else {
            format!("{parent_relative}/{name}")
        }
    }

    fn attr_for(&self, ino: u64, identity: &FileIdentity) -> Result<FileAttr, Errno> {
        match identity.kind {
            Kind::Real => {
                let meta = std::fs::symlink_metadata(&identity.paths.abs_real).map_err(|_| Errno::ENOENT)?;
                Ok(FileAttr {
                    ino: INodeNo(ino),
                    size: meta.len(),
                    blocks: meta.blocks(),
                    atime: meta.accessed().unwrap_or(UNIX_EPOCH),
                    mtime: meta.modified().unwrap_or(UNIX_EPOCH),
                    ctime: f64_to_systemtime(meta.ctime() as f64 + meta.ctime_nsec() as f64 / 1e9),
                    crtime: UNIX_EPOCH,
                    kind: file_type_of(meta.file_type()),
                    perm: (meta.mode() & 0o7777) as u16,
                    nlink: meta.nlink() as u32,
                    uid: meta.uid(),
                    gid: meta.gid(),
                    rdev: meta.rdev() as u32,
                    blksize: 4096,
                    flags: 0,
                })
            }
            Kind::Vdf => {
                let kind = if identity.is_dir { FileType::Directory } else { FileType::RegularFile };
                let (size, mtime) = if identity.is_dir {
                    (0, identity.mtime)
                } else {
                    match self.service.cache_entry(identity) {
                        Ok(entry) => {
                            let size = if entry.size() > 0 || entry.is_finalized() {
                                entry.size()
                            } else {
                                identity.init_size
                            };
                            (size, if entry.mtime() > 0.0 { entry.mtime() } else { identity.mtime })
                        }
                        Err(_) => (identity.init_size, identity.mtime),
                    }
                };
                let perm = if identity.is_dir { 0o755 } else { 0o444 };
                Ok(FileAttr {
                    ino: INodeNo(ino),
                    size,
                    blocks: size.div_ceil(512),
                    atime: f64_to_systemtime(mtime),
                    mtime: f64_to_systemtime(mtime),
                    ctime: f64_to_systemtime(mtime),
                    crtime: UNIX_EPOCH,
                    kind,
                    perm,
                    nlink: 1,
                    uid: 0,
                    gid: 0,
                    rdev: 0,
                    blksize: self.service.config.block_size.min(u32::MAX as u64) as u32,
                    flags: 0,
                })
            }
            Kind::Control => Ok(FileAttr {
                ino: INodeNo(ino),
                size: self.service.config.api_size,
                blocks: 0,
                atime: UNIX_EPOCH,
                mtime: UNIX_EPOCH,
                ctime: UNIX_EPOCH,
                crtime: UNIX_EPOCH,
                kind: FileType::RegularFile,
                perm: 0o666,
                nlink: 1,
                uid: 0,
                gid: 0,
                rdev: 0,
                blksize: 4096,
                flags: 0,
            }),
            Kind::Pipe => Err(Errno::EINVAL),
        }
    }

    fn ephemeral(&self, identity: &FileIdentity, pid: u32) -> Descriptor {
        Descriptor {
            id: 0,
            identity: identity.clone(),
            flags: None,
            open_pid: pid,
            os_fd: None,
        }
    }

    fn register_metadata_read(&self, identity: &FileIdentity, pid: u32, op: OpKind) {
        if matches!(identity.kind, Kind::Real | Kind::Vdf) {
            let descriptor = self.ephemeral(identity, pid);
            if let Err(err) = self.service.store.register_op_read(&descriptor, pid, op) {
                warn!("provenance register_op_read failed: {err}");
            }
        }
    }

    fn register_metadata_write(&self, identity: &FileIdentity, pid: u32, op: OpKind, create: bool) {
        if matches!(identity.kind, Kind::Real | Kind::Vdf) {
            let descriptor = self.ephemeral(identity, pid);
            if let Err(err) = self.service.store.register_op_write(&descriptor, pid, op, create) {
                warn!("provenance register_op_write failed: {err}");
            }
        }
    }

    fn internal_producer_for<'a>(&'a self, identity: &FileIdentity) -> Option<Box<dyn Fn(&Path) -> crate::error::Result<()> + 'a>> {
        self.service.internal_producer(identity)
    }
}

fn file_type_of(ft: std::fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_fifo() {
            FileType::NamedPipe
        } else if ft.is_char_device() {
            FileType::CharDevice
        } else if ft.is_block_device() {
            FileType::BlockDevice
        } else if ft.is_socket() {
            FileType::Socket
        } else {
            FileType::RegularFile
        }
    }
}

impl Filesystem for RepeatFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::io::Result<()> {
        debug!("repeatfs mounted at {:?}", self.service.mount);
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("repeatfs unmounting");
    }

    fn lookup(&self, req: &Request<'_>, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let (parent_relative, _parent_identity) = match self.resolve_ino(parent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let relative = self.child_path(&parent_relative, name);
        let identity = self.service.resolver.resolve(&relative);
        if !identity.valid {
            reply.error(Errno::ENOENT);
            return;
        }

        self.register_metadata_read(&identity, req.pid(), OpKind::ATTR);

        let ino = self.inodes.lock().ino_for(&relative);
        match self.attr_for(ino, &identity) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn getattr(&self, req: &Request<'_>, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let (_relative, identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };

        self.register_metadata_read(&identity, req.pid(), OpKind::ATTR);

        match self.attr_for(ino.0, &identity) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        req: &Request<'_>,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<fuser::BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let (_relative, identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };

        let mut touched = OpKind::empty();
        if mode.is_some() {
            touched |= OpKind::CHMOD;
        }
        if uid.is_some() || gid.is_some() {
            touched |= OpKind::CHOWN;
        }
        if size.is_some() {
            touched |= OpKind::ATTR;
        }
        if touched.is_empty() {
            touched = OpKind::ATTR;
        }
        self.register_metadata_write(&identity, req.pid(), touched, false);

        match identity.kind {
            Kind::Real => {
                if mode.is_some() || uid.is_some() || gid.is_some() {
                    if let Some(mode) = mode {
                        if let Err(e) = std::fs::set_permissions(&identity.paths.abs_real, std::fs::Permissions::from_mode(mode)) {
                            return reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)));
                        }
                    }
                    if uid.is_some() || gid.is_some() {
                        let c_path = std::ffi::CString::new(identity.paths.abs_real.as_os_str().as_bytes()).unwrap();
                        unsafe {
                            libc::chown(
                                c_path.as_ptr(),
                                uid.unwrap_or(u32::MAX),
                                gid.unwrap_or(u32::MAX),
                            );
                        }
                    }
                }
                if let Some(size) = size {
                    if let Err(e) = std::fs::File::open(&identity.paths.abs_real).and_then(|f| f.set_len(size)) {
                        return reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)));
                    }
                }
            }
            Kind::Vdf => {
                if mode.is_some() || uid.is_some() || gid.is_some() {
                    return reply.error(Errno::EPERM);
                }
                if let Some(size) = size {
                    let pid = req.pid();
                    let descriptor = fh.map(|h| h.0).unwrap_or(0);
                    if let Ok(entry) = self.service.cache_entry(&identity) {
                        let producer = self.internal_producer_for(&identity);
                        if let Err(err) = entry.truncate_owner(
                            size,
                            descriptor,
                            pid,
                            &self.service.descriptors,
                            &self.service.history,
                            producer.as_deref(),
                        ) {
                            return reply.error(Errno::from(&err));
                        }
                    }
                }
            }
            Kind::Control | Kind::Pipe => return reply.error(Errno::EPERM),
        }

        match self.attr_for(ino.0, &identity) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn readlink(&self, req: &Request<'_>, ino: INodeNo, reply: ReplyData) {
        let (_relative, identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        self.register_metadata_read(&identity, req.pid(), OpKind::GETLINK);

        if identity.kind != Kind::Real {
            return reply.error(Errno::EINVAL);
        }
        match std::fs::read_link(&identity.paths.abs_real) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO))),
        }
    }

    fn mknod(&self, req: &Request<'_>, parent: INodeNo, name: &OsStr, mode: u32, _umask: u32, rdev: u32, reply: ReplyEntry) {
        let (parent_relative, _parent_identity) = match self.resolve_ino(parent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let relative = self.child_path(&parent_relative, name);
        let identity = self.service.resolver.resolve(&relative);
        if identity.kind != Kind::Real && identity.valid {
            return reply.error(Errno::EPERM);
        }

        let c_path = std::ffi::CString::new(identity.paths.abs_real.as_os_str().as_bytes()).unwrap();
        let rc = unsafe { libc::mknod(c_path.as_ptr(), mode, rdev as libc::dev_t) };
        if rc != 0 {
            return reply.error(Errno::from_i32(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
        }

        let fresh = self.service.resolver.resolve(&relative);
        self.register_metadata_write(&fresh, req.pid(), OpKind::MKNOD, true);

        let ino = self.inodes.lock().ino_for(&relative);
        match self.attr_for(ino, &fresh) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn mkdir(&self, req: &Request<'_>, parent: INodeNo, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let (parent_relative, _parent_identity) = match self.resolve_ino(parent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let relative = self.child_path(&parent_relative, name);
        let identity = self.service.resolver.resolve(&relative);
        if identity.valid && identity.kind != Kind::Real {
            return reply.error(Errno::EPERM);
        }

        if let Err(e) = std::fs::create_dir(&identity.paths.abs_real) {
            return reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)));
        }
        let _ = std::fs::set_permissions(&identity.paths.abs_real, std::fs::Permissions::from_mode(mode));

        let fresh = self.service.resolver.resolve(&relative);
        self.register_metadata_write(&fresh, req.pid(), OpKind::MKDIR, true);

        let ino = self.inodes.lock().ino_for(&relative);
        match self.attr_for(ino, &fresh) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn unlink(&self, req: &Request<'_>, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let (parent_relative, _parent_identity) = match self.resolve_ino(parent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let relative = self.child_path(&parent_relative, name);
        let identity = self.service.resolver.resolve(&relative);

        self.register_metadata_write(&identity, req.pid(), OpKind::UNLINK, false);

        if identity.kind != Kind::Real {
            return reply.error(Errno::EPERM);
        }
        match std::fs::remove_file(&identity.paths.abs_real) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO))),
        }
    }

    fn rmdir(&self, req: &Request<'_>, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let (parent_relative, _parent_identity) = match self.resolve_ino(parent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let relative = self.child_path(&parent_relative, name);
        let identity = self.service.resolver.resolve(&relative);

        self.register_metadata_write(&identity, req.pid(), OpKind::RMDIR, false);

        if identity.kind != Kind::Real {
            return reply.error(Errno::EPERM);
        }
        match std::fs::remove_dir(&identity.paths.abs_real) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO))),
        }
    }

    fn symlink(&self, req: &Request<'_>, parent: INodeNo, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let (parent_relative, _parent_identity) = match self.resolve_ino(parent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let relative = self.child_path(&parent_relative, link_name);
        let identity = self.service.resolver.resolve(&relative);
        if identity.valid && identity.kind != Kind::Real {
            return reply.error(Errno::EPERM);
        }

        if let Err(e) = std::os::unix::fs::symlink(target, &identity.paths.abs_real) {
            return reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)));
        }

        let fresh = self.service.resolver.resolve(&relative);
        self.register_metadata_write(&fresh, req.pid(), OpKind::MKSYM, true);

        let ino = self.inodes.lock().ino_for(&relative);
        match self.attr_for(ino, &fresh) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn rename(
        &self,
        req: &Request<'_>,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: fuser::RenameFlags,
        reply: ReplyEmpty,
    ) {
        let (parent_relative, _) = match self.resolve_ino(parent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let (new_parent_relative, _) = match self.resolve_ino(newparent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let old_relative = self.child_path(&parent_relative, name);
        let new_relative = self.child_path(&new_parent_relative, newname);

        let old_identity = self.service.resolver.resolve(&old_relative);
        let new_identity = self.service.resolver.resolve(&new_relative);

        self.register_metadata_read(&old_identity, req.pid(), OpKind::MOVE);

        if old_identity.kind != Kind::Real || (new_identity.valid && new_identity.kind != Kind::Real) {
            return reply.error(Errno::EPERM);
        }

        if let Err(e) = std::fs::rename(&old_identity.paths.abs_real, &new_identity.paths.abs_real) {
            return reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)));
        }

        let fresh_new = self.service.resolver.resolve(&new_relative);
        self.register_metadata_write(&fresh_new, req.pid(), OpKind::MOVE, true);
        self.service.descriptors.retarget_on_rename(&old_identity.paths.abs_real, &fresh_new);
        self.inodes.lock().retarget(&old_relative, &new_relative);

        reply.ok();
    }

    fn link(&self, req: &Request<'_>, ino: INodeNo, newparent: INodeNo, newname: &OsStr, reply: ReplyEntry) {
        let (_relative, source_identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let (new_parent_relative, _) = match self.resolve_ino(newparent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let new_relative = self.child_path(&new_parent_relative, newname);
        let link_identity = self.service.resolver.resolve(&new_relative);

        self.register_metadata_read(&source_identity, req.pid(), OpKind::MKHARD);

        if source_identity.kind != Kind::Real || (link_identity.valid && link_identity.kind != Kind::Real) {
            return reply.error(Errno::EPERM);
        }

        if let Err(e) = std::fs::hard_link(&source_identity.paths.abs_real, &link_identity.paths.abs_real) {
            return reply.error(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO)));
        }

        let fresh = self.service.resolver.resolve(&new_relative);
        self.register_metadata_write(&fresh, req.pid(), OpKind::MKHARD, true);

        let new_ino = self.inodes.lock().ino_for(&new_relative);
        match self.attr_for(new_ino, &fresh) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn open(&self, req: &Request<'_>, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let (_relative, identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        if !identity.valid {
            return reply.error(Errno::ENOENT);
        }

        let pid = req.pid();
        let raw_flags = flags.0;
        let is_write = crate::descriptor::is_flag_write(raw_flags);

        match identity.kind {
            Kind::Real => {
                let os_flags = if is_write {
                    if raw_flags & libc::O_RDWR != 0 { libc::O_RDWR } else { libc::O_WRONLY }
                } else {
                    libc::O_RDONLY
                };
                let c_path = std::ffi::CString::new(identity.paths.abs_real.as_os_str().as_bytes()).unwrap();
                let fd = unsafe { libc::open(c_path.as_ptr(), os_flags) };
                if fd < 0 {
                    return reply.error(Errno::from_i32(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }

                let descriptor_id = self.service.descriptors.open(identity.clone(), Some(raw_flags), pid, Some(fd as RawFd));
                if let Some(descriptor) = self.service.descriptors.get(descriptor_id) {
                    if let Err(err) = self.service.store.register_open(&descriptor, pid, !is_write, is_write, true, true, false) {
                        warn!("provenance register_open failed: {err}");
                    }
                }
                reply.opened(FileHandle(descriptor_id), FopenFlags::empty());
            }
            Kind::Vdf => {
                if is_write {
                    let entry = match self.service.cache_entry(&identity) {
                        Ok(e) => e,
                        Err(err) => return reply.error(Errno::from(&err)),
                    };
                    if !entry.identity().derived_source.is_some() {
                        return reply.error(Errno::EACCES);
                    }
                }

                let descriptor_id = self.service.descriptors.open(identity.clone(), Some(raw_flags), pid, None);
                if !identity.is_dir {
                    if let Ok(entry) = self.service.cache_entry(&identity) {
                        entry.register_descriptor(&self.service.descriptors, descriptor_id);
                    }
                }
                if let Some(descriptor) = self.service.descriptors.get(descriptor_id) {
                    if let Err(err) = self.service.store.register_open(&descriptor, pid, true, is_write, true, true, false) {
                        warn!("provenance register_open failed: {err}");
                    }
                }
                reply.opened(FileHandle(descriptor_id), FopenFlags::DIRECT_IO);
            }
            Kind::Control => {
                let descriptor_id = self.service.descriptors.open(identity.clone(), Some(raw_flags), pid, None);
                self.service.control.open_session(descriptor_id);
                reply.opened(FileHandle(descriptor_id), FopenFlags::DIRECT_IO);
            }
            Kind::Pipe => reply.error(Errno::EINVAL),
        }
    }

    fn read(
        &self,
        _req: &Request<'_>,
        _ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<fuser::LockOwner>,
        reply: ReplyData,
    ) {
        let descriptor_id: DescriptorId = fh.0;
        let descriptor = match self.service.descriptors.get(descriptor_id) {
            Some(d) => d,
            None => return reply.error(Errno::EBADF),
        };

        if let Err(err) = self.service.store.register_read(&descriptor, descriptor.open_pid, OpKind::IO, false, None) {
            warn!("provenance register_read failed: {err}");
        }

        match descriptor.identity.kind {
            Kind::Real => {
                let fd = match descriptor.os_fd {
                    Some(fd) => fd,
                    None => return reply.error(Errno::EBADF),
                };
                let mut buf = vec![0u8; size as usize];
                let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset as libc::off_t) };
                if n < 0 {
                    return reply.error(Errno::from_i32(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                buf.truncate(n as usize);
                reply.data(&buf);
            }
            Kind::Vdf => {
                let entry = match self.service.cache_entry(&descriptor.identity) {
                    Ok(e) => e,
                    Err(err) => return reply.error(Errno::from(&err)),
                };
                let producer = self.internal_producer_for(&descriptor.identity);
                match entry.io(
                    Operation::Read,
                    offset,
                    None,
                    size as u64,
                    descriptor_id,
                    &self.service.descriptors,
                    &self.service.history,
                    producer.as_deref(),
                ) {
                    Ok(IoOutcome::Read(data)) => reply.data(&data),
                    Ok(_) => reply.data(&[]),
                    Err(err) => reply.error(Errno::from(&err)),
                }
            }
            Kind::Control => {
                let data = self.service.control.read(descriptor_id, size as usize);
                reply.data(&data);
            }
            Kind::Pipe => reply.error(Errno::EINVAL),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        _req: &Request<'_>,
        _ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<fuser::LockOwner>,
        reply: ReplyWrite,
    ) {
        let descriptor_id: DescriptorId = fh.0;
        let descriptor = match self.service.descriptors.get(descriptor_id) {
            Some(d) => d,
            None => return reply.error(Errno::EBADF),
        };

        if let Err(err) = self.service.store.register_write(&descriptor, descriptor.open_pid, OpKind::IO, false, None) {
            warn!("provenance register_write failed: {err}");
        }

        match descriptor.identity.kind {
            Kind::Real => {
                let fd = match descriptor.os_fd {
                    Some(fd) => fd,
                    None => return reply.error(Errno::EBADF),
                };
                let n = unsafe { libc::pwrite(fd, data.as_ptr() as *const libc::c_void, data.len(), offset as libc::off_t) };
                if n < 0 {
                    return reply.error(Errno::from_i32(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
                }
                reply.written(n as u32);
            }
            Kind::Vdf => {
                let entry = match self.service.cache_entry(&descriptor.identity) {
                    Ok(e) => e,
                    Err(err) => return reply.error(Errno::from(&err)),
                };
                let producer = self.internal_producer_for(&descriptor.identity);
                match entry.write_owner(
                    data,
                    offset as u64,
                    descriptor_id,
                    descriptor.open_pid,
                    &self.service.descriptors,
                    &self.service.history,
                    producer.as_deref(),
                ) {
                    Ok(n) => reply.written(n as u32),
                    Err(err) => reply.error(Errno::from(&err)),
                }
            }
            Kind::Control => {
                self.service.control.write(&self.service, descriptor_id, data);
                reply.written(data.len() as u32);
            }
            Kind::Pipe => reply.error(Errno::EINVAL),
        }
    }

    fn flush(&self, _req: &Request<'_>, _ino: INodeNo, _fh: FileHandle, _lock_owner: fuser::LockOwner, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &self,
        _req: &Request<'_>,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<fuser::LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let descriptor_id: DescriptorId = fh.0;
        if let Some(descriptor) = self.service.descriptors.get(descriptor_id) {
            match descriptor.identity.kind {
                Kind::Real => {
                    if let Some(fd) = descriptor.os_fd {
                        unsafe {
                            libc::close(fd);
                        }
                    }
                }
                Kind::Vdf => {
                    if !descriptor.identity.is_dir {
                        if let Ok(entry) = self.service.cache_entry(&descriptor.identity) {
                            if let Err(err) = entry.unregister_descriptor(&self.service.descriptors, descriptor_id) {
                                warn!("unregister_descriptor failed: {err}");
                            }
                        }
                    }
                }
                Kind::Control => self.service.control.close_session(descriptor_id),
                Kind::Pipe => {}
            }

            if let Err(err) = self.service.store.register_close(&descriptor, true) {
                warn!("provenance register_close failed: {err}");
            }
        }
        self.service.descriptors.close(descriptor_id);
        reply.ok();
    }

    fn fsync(&self, _req: &Request<'_>, _ino: INodeNo, fh: FileHandle, _datasync: bool, reply: ReplyEmpty) {
        let descriptor_id: DescriptorId = fh.0;
        if let Some(descriptor) = self.service.descriptors.get(descriptor_id) {
            if descriptor.identity.kind == Kind::Real {
                if let Some(fd) = descriptor.os_fd {
                    unsafe {
                        libc::fsync(fd);
                    }
                }
            }
        }
        reply.ok();
    }

    fn opendir(&self, req: &Request<'_>, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let (_relative, identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        self.register_metadata_read(&identity, req.pid(), OpKind::GETDIR);

        let descriptor_id = self.service.descriptors.open(identity, Some(flags.0), req.pid(), None);
        reply.opened(FileHandle(descriptor_id), FopenFlags::empty());
    }

    fn readdir(&self, req: &Request<'_>, ino: INodeNo, _fh: FileHandle, offset: u64, mut reply: ReplyDirectory) {
        let (relative, identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };

        if !identity.is_dir && !relative.is_empty() {
            return reply.error(Errno::ENOTDIR);
        }

        let mut names: Vec<(String, FileType)> = vec![
            (".".to_string(), FileType::Directory),
            ("..".to_string(), FileType::Directory),
        ];

        if identity.derived_source.is_none() {
            if let Ok(read_dir) = std::fs::read_dir(&identity.paths.abs_real) {
                for entry in read_dir.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let kind = entry.file_type().map(file_type_of).unwrap_or(FileType::RegularFile);
                    names.push((name, kind));
                }
            }
        } else {
            for action_name in identity.derived_actions.keys() {
                names.push((action_name.clone(), FileType::RegularFile));
            }
        }

        if !self.service.config.invisible {
            let suffix = &self.service.config.suffix;
            let extra: Vec<String> = names
                .iter()
                .filter(|(name, _)| name != "." && name != "..")
                .map(|(name, _)| name.clone())
                .collect();
            for name in extra {
                let child_relative = self.child_path(&relative, OsStr::new(&name));
                let child_identity = self.service.resolver.resolve(&child_relative);
                if !child_identity.derived_actions.is_empty() {
                    let dot = if self.service.config.hidden { "." } else { "" };
                    names.push((format!("{dot}{name}{suffix}"), FileType::Directory));
                }
            }
        }

        for (i, (name, kind)) in names.into_iter().enumerate().skip(offset as usize) {
            let child_relative = self.child_path(&relative, OsStr::new(&name));
            let child_ino = if name == "." {
                ino.0
            } else if name == ".." {
                ino.0
            } else {
                self.inodes.lock().ino_for(&child_relative)
            };

            self.register_metadata_read(&self.service.resolver.resolve(&child_relative), req.pid(), OpKind::GETDIR);

            if reply.add(INodeNo(child_ino), (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&self, _req: &Request<'_>, _ino: INodeNo, fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        self.service.descriptors.close(fh.0);
        reply.ok();
    }

    fn statfs(&self, req: &Request<'_>, ino: INodeNo, reply: ReplyStatfs) {
        let (_relative, identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        self.register_metadata_read(&identity, req.pid(), OpKind::STATS);
        let path = if identity.kind == Kind::Real {
            identity.paths.abs_real.clone()
        } else {
            self.service.root.clone()
        };

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return reply.error(Errno::EIO);
        }

        reply.statfs(
            stat.f_blocks,
            stat.f_bfree,
            stat.f_bavail,
            stat.f_files,
            stat.f_ffree,
            stat.f_bsize as u32,
            stat.f_namemax as u32,
            stat.f_frsize as u32,
        );
    }

    fn access(&self, req: &Request<'_>, ino: INodeNo, mask: fuser::AccessFlags, reply: ReplyEmpty) {
        let (_relative, identity) = match self.resolve_ino(ino) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };

        self.register_metadata_read(&identity, req.pid(), OpKind::ACCESS);

        let check_identity = identity.derived_source.as_deref().unwrap_or(&identity);
        let c_path = std::ffi::CString::new(check_identity.paths.abs_real.as_os_str().as_bytes()).unwrap();
        let rc = unsafe { libc::access(c_path.as_ptr(), mask.bits()) };
        if rc != 0 {
            reply.error(Errno::EACCES);
        } else {
            reply.ok();
        }
    }

    fn create(&self, req: &Request<'_>, parent: INodeNo, name: &OsStr, mode: u32, _umask: u32, flags: i32, reply: ReplyCreate) {
        let (parent_relative, _parent_identity) = match self.resolve_ino(parent) {
            Ok(v) => v,
            Err(err) => return reply.error(err),
        };
        let relative = self.child_path(&parent_relative, name);
        let identity = self.service.resolver.resolve(&relative);
        if identity.valid && identity.kind != Kind::Real {
            return reply.error(Errno::EPERM);
        }

        let c_path = std::ffi::CString::new(identity.paths.abs_real.as_os_str().as_bytes()).unwrap();
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_CREAT | libc::O_WRONLY, mode) };
        if fd < 0 {
            return reply.error(Errno::from_i32(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
        }

        let fresh = self.service.resolver.resolve(&relative);
        let pid = req.pid();
        let descriptor_id = self.service.descriptors.open(fresh.clone(), Some(flags), pid, Some(fd as RawFd));
        if let Some(descriptor) = self.service.descriptors.get(descriptor_id) {
            if let Err(err) = self.service.store.register_open(&descriptor, pid, true, true, true, true, true) {
                warn!("provenance register_open failed: {err}");
            }
        }

        let ino = self.inodes.lock().ino_for(&relative);
        match self.attr_for(ino, &fresh) {
            Ok(attr) => reply.created(&TTL, &attr, 0, FileHandle(descriptor_id), 0),
            Err(err) => reply.error(err),
        }
    }
}
