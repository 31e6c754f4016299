//! FUSE adapter for a live mount
//!
//! Implements `fuser::Filesystem` by entering the mount for every request
//! and blocking the FUSE thread on the async operation.

use std::ffi::OsStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tokio::runtime::Handle;

use common::prelude::NodeInfo;

use super::error::InodeError;
use super::mount::LiveMount;

impl InodeError {
    /// The errno reported to the kernel
    pub fn errno(&self) -> libc::c_int {
        match self {
            InodeError::NotFound => libc::ENOENT,
            InodeError::NotDirectory => libc::ENOTDIR,
            InodeError::IsDirectory => libc::EISDIR,
            InodeError::NotEmpty => libc::ENOTEMPTY,
            InodeError::Exists => libc::EEXIST,
            InodeError::ReadOnly => libc::EROFS,
            InodeError::AccessDenied => libc::EACCES,
            InodeError::InvalidName => libc::EINVAL,
            InodeError::FileTooLarge => libc::EFBIG,
            InodeError::BadHandle(_) => libc::EBADF,
            InodeError::Unmounted | InodeError::Store(_) | InodeError::Client(_) => libc::EIO,
        }
    }
}

pub struct MountFs {
    /// Tokio runtime handle for async operations
    rt: Handle,
    mount: Weak<LiveMount>,
    /// Generation of the mount this session was attached for
    generation: u64,
}

impl MountFs {
    /// Default TTL for FUSE attributes
    const ATTR_TTL: Duration = Duration::from_secs(1);

    /// Block size for FUSE
    const BLOCK_SIZE: u32 = 512;

    pub fn new(mount: Weak<LiveMount>, generation: u64, rt: Handle) -> Self {
        Self {
            rt,
            mount,
            generation,
        }
    }

    fn make_attr(inode: u64, info: &NodeInfo, read_only: bool) -> FileAttr {
        let kind = if info.is_directory {
            FileType::Directory
        } else {
            FileType::RegularFile
        };

        let mtime = UNIX_EPOCH + Duration::from_secs(info.modified.max(0) as u64);
        let perm = match (info.is_directory, read_only) {
            (true, false) => 0o755,
            (true, true) => 0o555,
            (false, false) => 0o644,
            (false, true) => 0o444,
        };

        FileAttr {
            ino: inode,
            size: info.size,
            blocks: info.size.div_ceil(Self::BLOCK_SIZE as u64),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }

    fn with_mount<T>(
        &self,
        op: impl FnOnce(&Arc<LiveMount>) -> Result<T, InodeError>,
    ) -> Result<T, InodeError> {
        match self.mount.upgrade() {
            Some(mount) => op(&mount),
            None => Err(InodeError::Unmounted),
        }
    }

    fn name(name: &OsStr) -> Result<&str, InodeError> {
        name.to_str().ok_or(InodeError::InvalidName)
    }
}

impl Filesystem for MountFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        let name = self.with_mount(|mount| Ok(mount.name())).unwrap_or_default();
        tracing::info!("FUSE filesystem initialized for mount {}", name);
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("FUSE filesystem destroyed (generation {})", self.generation);
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.with_mount(|mount| {
            let name = Self::name(name)?;
            let request = mount.enter(self.generation)?;
            let (inode, info) = self.rt.block_on(request.lookup(parent, name))?;
            Ok(Self::make_attr(inode, &info, request.read_only()))
        });

        match result {
            Ok(attr) => reply.entry(&Self::ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        // a retired mount has nothing left to forget
        let _ = self.with_mount(|mount| {
            mount.enter(self.generation)?.forget(ino, nlookup);
            Ok(())
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self.with_mount(|mount| {
            let request = mount.enter(self.generation)?;
            let info = self.rt.block_on(request.getattr(ino))?;
            Ok(Self::make_attr(ino, &info, request.read_only()))
        });

        match result {
            Ok(attr) => reply.attr(&Self::ATTR_TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.with_mount(|mount| {
            let request = mount.enter(self.generation)?;
            let info = match size {
                Some(size) => self.rt.block_on(request.truncate(ino, size, fh))?,
                // times are owned by the cloud; report what it has
                None => self.rt.block_on(request.getattr(ino))?,
            };
            Ok(Self::make_attr(ino, &info, request.read_only()))
        });

        match result {
            Ok(attr) => reply.attr(&Self::ATTR_TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let result = self.with_mount(|mount| {
            let request = mount.enter(self.generation)?;
            self.rt.block_on(request.readdir(ino))
        });

        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
            let kind = if entry.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            if reply.add(entry.inode, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }

        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_APPEND != 0;
        let truncate = flags & libc::O_TRUNC != 0;

        let result = self.with_mount(|mount| {
            let request = mount.enter(self.generation)?;
            self.rt.block_on(request.open(ino, write, truncate))
        });

        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.with_mount(|mount| {
            let request = mount.enter(self.generation)?;
            self.rt
                .block_on(request.read(ino, fh, offset.max(0) as u64, size))
        });

        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.with_mount(|mount| {
            let request = mount.enter(self.generation)?;
            self.rt
                .block_on(request.write(fh, offset.max(0) as u64, data))
        });

        match result {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let result = self.with_mount(|mount| {
            let request = mount.enter(self.generation)?;
            self.rt.block_on(request.flush(fh))
        });

        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                tracing::error!("failed to flush file handle {}: {}", fh, e);
                reply.error(e.errno())
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let result = self.with_mount(|mount| {
            let request = mount.enter(self.generation)?;
            self.rt.block_on(request.release(fh))
        });

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.with_mount(|mount| {
            let name = Self::name(name)?;
            let request = mount.enter(self.generation)?;
            let (inode, info, fh) = self.rt.block_on(request.create(parent, name))?;
            Ok((Self::make_attr(inode, &info, request.read_only()), fh))
        });

        match result {
            Ok((attr, fh)) => reply.created(&Self::ATTR_TTL, &attr, 0, fh, flags as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.with_mount(|mount| {
            let name = Self::name(name)?;
            let request = mount.enter(self.generation)?;
            let (inode, info) = self.rt.block_on(request.mkdir(parent, name))?;
            Ok(Self::make_attr(inode, &info, request.read_only()))
        });

        match result {
            Ok(attr) => reply.entry(&Self::ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.with_mount(|mount| {
            let name = Self::name(name)?;
            let request = mount.enter(self.generation)?;
            self.rt.block_on(request.unlink(parent, name))
        });

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.with_mount(|mount| {
            let name = Self::name(name)?;
            let request = mount.enter(self.generation)?;
            self.rt.block_on(request.rmdir(parent, name))
        });

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.with_mount(|mount| {
            let name = Self::name(name)?;
            let newname = Self::name(newname)?;
            let request = mount.enter(self.generation)?;
            self.rt
                .block_on(request.rename(parent, name, newparent, newname))
        });

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    // Extended attribute stubs - macOS queries these but handles ENOTSUP gracefully
    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(InodeError::NotFound.errno(), libc::ENOENT);
        assert_eq!(InodeError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(InodeError::FileTooLarge.errno(), libc::EFBIG);
        // requests against a torn down mount fail, they never crash
        assert_eq!(InodeError::Unmounted.errno(), libc::EIO);
    }

    #[tokio::test]
    async fn test_dropped_mount_is_unmounted() {
        let fs = MountFs::new(Weak::new(), 1, Handle::current());
        assert_eq!(
            fs.with_mount(|mount| Ok(mount.name())),
            Err(InodeError::Unmounted)
        );
    }
}
