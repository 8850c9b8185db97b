//! Filesystem operation replies
//!
//! A reply type is created for (almost) every kind of request the kernel can send. Each
//! reply consumes `self` when sent, so a request can be answered at most once; if a reply
//! value is dropped without ever being sent, it replies with `EIO` so the kernel driver is
//! never left waiting on a request that silently vanished.

use std::fmt;
use std::io;
use std::io::IoSlice;
use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;
#[cfg(target_os = "macos")]
use std::time::SystemTime;

use log::warn;
use zerocopy::{Immutable, IntoBytes};

use crate::ll;
use crate::ll::reply::{Attr, DirEntList, DirEntOffset, DirEntPlusList, DirEntry, DirEntryPlus, Response};
use crate::ll::{Errno, FileHandle, Generation, INodeNo, Lock, RequestId};
use crate::{FileAttr, FileType, FopenFlags, PollEvents};

/// Generic reply callback to send data.
pub(crate) trait ReplySender: Send + Sync + Unpin + 'static {
    /// Send data.
    fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()>;
}

impl fmt::Debug for Box<dyn ReplySender> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "Box<ReplySender>")
    }
}

/// A reply to a request.
pub(crate) trait Reply {
    /// Create a new reply for the given request.
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self;
}

/// Raw reply, typed by the kernel struct it eventually serializes (or `()` when the reply
/// doesn't carry one). Every concrete `Reply*` type below is a thin wrapper around this.
#[derive(Debug)]
pub(crate) struct ReplyRaw<T> {
    unique: RequestId,
    sender: Option<Box<dyn ReplySender>>,
    marker: PhantomData<T>,
}

impl<T> Reply for ReplyRaw<T> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        ReplyRaw {
            unique: RequestId(unique),
            sender: Some(Box::new(sender)),
            marker: PhantomData,
        }
    }
}

impl<T> ReplyRaw<T> {
    fn send_ll(&mut self, response: &Response<'_>) {
        assert!(self.sender.is_some());
        let sender = self.sender.take().unwrap();
        let res = response.with_iovec(self.unique, |iov| sender.send(iov));
        if let Err(err) = res {
            warn!("Failed to send FUSE reply: {err}");
        }
    }

    /// Reply to a request with an error code.
    pub(crate) fn error(mut self, err: Errno) {
        self.send_ll(&Response::new_error(err));
    }
}

impl<T: IntoBytes + Immutable> ReplyRaw<T> {
    pub(crate) fn ok(mut self, data: &T) {
        self.send_ll(&Response::from_struct(data));
    }
}

impl<T> Drop for ReplyRaw<T> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!("Reply not sent for operation {}, replying with I/O error", self.unique.0);
            self.send_ll(&Response::new_error(Errno::EIO));
        }
    }
}

/// Reply to a request with nothing.
#[derive(Debug)]
pub struct ReplyEmpty(ReplyRaw<()>);

impl Reply for ReplyEmpty {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyEmpty {
    /// Reply to a general request with success.
    pub fn ok(self) {
        self.0.send_ll_empty();
    }

    /// Reply to a general request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

impl ReplyRaw<()> {
    fn send_ll_empty(mut self) {
        self.send_ll(&Response::new_empty());
    }
}

/// Reply to a request with a slice of data.
#[derive(Debug)]
pub struct ReplyData(ReplyRaw<()>);

impl Reply for ReplyData {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyData {
    /// Reply to a request with the given data.
    pub fn data(mut self, data: &[u8]) {
        self.0.send_ll(&Response::new_slice(data));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a request with a file entry.
#[derive(Debug)]
pub struct ReplyEntry(ReplyRaw<()>);

impl Reply for ReplyEntry {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyEntry {
    /// Reply to a request with the given entry.
    pub fn entry(mut self, ttl: &Duration, attr: &FileAttr, generation: u64) {
        self.0.send_ll(&Response::new_entry(
            attr.ino,
            Generation(generation),
            &Attr::from(attr),
            *ttl,
            *ttl,
        ));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a request with file attributes.
#[derive(Debug)]
pub struct ReplyAttr(ReplyRaw<()>);

impl Reply for ReplyAttr {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyAttr {
    /// Reply to a request with the given attributes.
    pub fn attr(mut self, ttl: &Duration, attr: &FileAttr) {
        self.0.send_ll(&Response::new_attr(ttl, &Attr::from(attr)));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

#[cfg(target_os = "macos")]
/// Reply to a request with xtimes attributes.
#[derive(Debug)]
pub struct ReplyXTimes(ReplyRaw<()>);

#[cfg(target_os = "macos")]
impl Reply for ReplyXTimes {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

#[cfg(target_os = "macos")]
impl ReplyXTimes {
    /// Reply to a request with the given xtimes.
    pub fn xtimes(mut self, bkuptime: SystemTime, crtime: SystemTime) {
        self.0.send_ll(&Response::new_xtimes(bkuptime, crtime));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a request with a newly opened file handle.
#[derive(Debug)]
pub struct ReplyOpen(ReplyRaw<()>);

impl Reply for ReplyOpen {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyOpen {
    /// Reply to a request with the given file handle and open flags.
    pub fn opened(mut self, fh: FileHandle, flags: FopenFlags) {
        self.0.send_ll(&Response::new_open(fh, flags, 0));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a request with the number of bytes written.
#[derive(Debug)]
pub struct ReplyWrite(ReplyRaw<()>);

impl Reply for ReplyWrite {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyWrite {
    /// Reply to a request with the number of bytes written.
    pub fn written(mut self, size: u32) {
        self.0.send_ll(&Response::new_write(size));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a statfs request.
#[derive(Debug)]
pub struct ReplyStatfs(ReplyRaw<()>);

impl Reply for ReplyStatfs {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyStatfs {
    /// Reply to a request with filesystem statistics.
    #[allow(clippy::too_many_arguments)]
    pub fn statfs(
        mut self,
        blocks: u64,
        bfree: u64,
        bavail: u64,
        files: u64,
        ffree: u64,
        bsize: u32,
        namelen: u32,
        frsize: u32,
    ) {
        self.0.send_ll(&Response::new_statfs(blocks, bfree, bavail, files, ffree, bsize, namelen, frsize));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a request with a newly created file entry and its open file handle.
#[derive(Debug)]
pub struct ReplyCreate(ReplyRaw<()>);

impl Reply for ReplyCreate {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyCreate {
    /// Reply to a request with the created entry and open handle.
    pub fn created(mut self, ttl: &Duration, attr: &FileAttr, generation: u64, fh: FileHandle, flags: u32) {
        self.0.send_ll(&Response::new_create(
            ttl,
            &Attr::from(attr),
            Generation(generation),
            fh,
            FopenFlags::from_bits_truncate(flags),
            0,
        ));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a request with a file lock.
#[derive(Debug)]
pub struct ReplyLock(ReplyRaw<()>);

impl Reply for ReplyLock {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyLock {
    /// Reply to a request with the given lock.
    pub fn locked(mut self, start: u64, end: u64, typ: i32, pid: u32) {
        self.0.send_ll(&Response::new_lock(&Lock { range: (start, end), typ, pid }));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a bmap request.
#[derive(Debug)]
pub struct ReplyBmap(ReplyRaw<()>);

impl Reply for ReplyBmap {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyBmap {
    /// Reply to a request with the given block.
    pub fn bmap(mut self, block: u64) {
        self.0.send_ll(&Response::new_bmap(block));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

#[cfg(feature = "abi-7-11")]
/// Reply to an ioctl request.
#[derive(Debug)]
pub struct ReplyIoctl(ReplyRaw<()>);

#[cfg(feature = "abi-7-11")]
impl Reply for ReplyIoctl {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

#[cfg(feature = "abi-7-11")]
impl ReplyIoctl {
    /// Reply to a request with the ioctl result and output data.
    pub fn ioctl(mut self, result: i32, data: &[u8]) {
        self.0.send_ll(&Response::new_ioctl(result, &[IoSlice::new(data)]));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

#[cfg(feature = "abi-7-11")]
/// Reply to a poll request.
#[derive(Debug)]
pub struct ReplyPoll(ReplyRaw<()>);

#[cfg(feature = "abi-7-11")]
impl Reply for ReplyPoll {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

#[cfg(feature = "abi-7-11")]
impl ReplyPoll {
    /// Reply to a request with the ready events.
    pub fn poll(mut self, revents: PollEvents) {
        self.0.send_ll(&Response::new_poll(revents));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

/// Reply to a readdir request.
#[derive(Debug)]
pub struct ReplyDirectory {
    reply: ReplyRaw<()>,
    buf: DirEntList,
}

impl ReplyDirectory {
    /// Create a `ReplyDirectory` that can accommodate up to `size` bytes of directory entries.
    pub(crate) fn new<S: ReplySender>(unique: RequestId, sender: S, size: usize) -> Self {
        Self {
            reply: ReplyRaw::new(unique.0, sender),
            buf: DirEntList::new(size),
        }
    }

    /// Add an entry to the reply buffer. Returns true if the buffer is full, at which point no
    /// more entries should be added and [`ok`](Self::ok) should be called.
    #[must_use]
    pub fn add<T: AsRef<Path>>(&mut self, ino: INodeNo, offset: i64, kind: FileType, name: T) -> bool {
        self.buf.push(&DirEntry::new(ino, DirEntOffset(offset as u64), kind, name))
    }

    /// Reply to a request with the filled directory buffer.
    pub fn ok(self) {
        self.reply.send_ll_dir(self.buf.into());
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

impl ReplyRaw<()> {
    fn send_ll_dir(mut self, response: Response<'_>) {
        self.send_ll(&response);
    }
}

#[cfg(feature = "abi-7-21")]
/// Reply to a readdirplus request.
#[derive(Debug)]
pub struct ReplyDirectoryPlus {
    reply: ReplyRaw<()>,
    buf: DirEntPlusList,
}

#[cfg(feature = "abi-7-21")]
impl ReplyDirectoryPlus {
    /// Create a `ReplyDirectoryPlus` that can accommodate up to `size` bytes of directory entries.
    pub(crate) fn new<S: ReplySender>(unique: RequestId, sender: S, size: usize) -> Self {
        Self {
            reply: ReplyRaw::new(unique.0, sender),
            buf: DirEntPlusList::new(size),
        }
    }

    /// Add an entry to the reply buffer. Returns true if the buffer is full.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn add<T: AsRef<Path>>(
        &mut self,
        ino: INodeNo,
        generation: u64,
        offset: i64,
        name: T,
        entry_ttl: &Duration,
        attr: &FileAttr,
        attr_ttl: &Duration,
    ) -> bool {
        self.buf.push(&DirEntryPlus::new(
            ino,
            Generation(generation),
            DirEntOffset(offset as u64),
            name,
            *entry_ttl,
            Attr::from(attr),
            *attr_ttl,
        ))
    }

    /// Reply to a request with the filled directory buffer.
    pub fn ok(self) {
        self.reply.send_ll_dir(self.buf.into());
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Reply to getxattr/listxattr requests.
#[derive(Debug)]
pub struct ReplyXattr(ReplyRaw<()>);

impl Reply for ReplyXattr {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

impl ReplyXattr {
    /// Reply to a request with the size of the attribute value.
    pub fn size(mut self, size: u32) {
        self.0.send_ll(&Response::new_xattr_size(size));
    }

    /// Reply to a request with the attribute's data.
    pub fn data(mut self, data: &[u8]) {
        self.0.send_ll(&Response::new_slice(data));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

#[cfg(feature = "abi-7-24")]
/// Reply to an lseek request.
#[derive(Debug)]
pub struct ReplyLseek(ReplyRaw<()>);

#[cfg(feature = "abi-7-24")]
impl Reply for ReplyLseek {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self(ReplyRaw::new(unique, sender))
    }
}

#[cfg(feature = "abi-7-24")]
impl ReplyLseek {
    /// Reply to a request with the new offset.
    pub fn offset(mut self, offset: i64) {
        self.0.send_ll(&Response::new_lseek(offset));
    }

    /// Reply to a request with an error code.
    pub fn error(self, err: Errno) {
        self.0.error(err);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc::{sync_channel, SyncSender};
    use std::thread;

    struct AssertSender {
        expected: Vec<u8>,
    }

    impl ReplySender for AssertSender {
        fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
            let mut v = vec![];
            for x in data {
                v.extend_from_slice(x);
            }
            assert_eq!(self.expected, v);
            Ok(())
        }
    }

    #[test]
    fn reply_empty() {
        let sender = AssertSender {
            expected: vec![
                0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00,
            ],
        };
        let reply = ReplyEmpty::new(0xdeadbeef, sender);
        reply.ok();
    }

    #[test]
    fn reply_error() {
        let sender = AssertSender {
            expected: vec![
                0x10, 0x00, 0x00, 0x00, 0xbe, 0xff, 0xff, 0xff, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00,
            ],
        };
        let reply = ReplyEmpty::new(0xdeadbeef, sender);
        reply.error(Errno::from_i32(66));
    }

    #[test]
    fn reply_data() {
        let sender = AssertSender {
            expected: vec![
                0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00, 0x00,
                0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
            ],
        };
        let reply = ReplyData::new(0xdeadbeef, sender);
        reply.data(&[0xde, 0xad, 0xbe, 0xef]);
    }

    impl ReplySender for SyncSender<()> {
        fn send(&self, _: &[IoSlice<'_>]) -> io::Result<()> {
            self.send(()).unwrap();
            Ok(())
        }
    }

    #[test]
    fn async_reply() {
        let (tx, rx) = sync_channel::<()>(1);
        let reply = ReplyEmpty::new(0xdeadbeef, tx);
        thread::spawn(move || {
            reply.ok();
        });
        rx.recv().unwrap();
    }
}
