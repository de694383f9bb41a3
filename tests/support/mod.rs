//! Shared test fixture: a tiny in-memory filesystem.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::time::Duration;

use parking_lot::Mutex;

use fusebind::AttrOut;
use fusebind::DirEntry;
use fusebind::Entry;
use fusebind::Errno;
use fusebind::Fd;
use fusebind::FileAttr;
use fusebind::FileInfo;
use fusebind::FileType;
use fusebind::FuseOps;
use fusebind::Gid;
use fusebind::Ino;
use fusebind::Mode;
use fusebind::OpResult;
use fusebind::OpenFlags;
use fusebind::ReaddirOut;
use fusebind::RequestContext;
use fusebind::ROOT_INO;
use fusebind::SetattrChanges;
use fusebind::TimeSpec;
use fusebind::Uid;

const PAGE_SIZE: usize = 20;

/// Hooks `log` output into the test harness; safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Node {
    attr: FileAttr,
    data: Vec<u8>,
    children: BTreeMap<OsString, Ino>,
}

impl Node {
    fn new_dir(ino: Ino, perm: u32) -> Node {
        Node {
            attr: FileAttr {
                nlink: 2,
                ..FileAttr::simple(ino, Mode::from_parts(FileType::Directory, perm))
            },
            data: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    fn new_file(ino: Ino, mode: Mode) -> Node {
        Node {
            attr: FileAttr::simple(ino, mode),
            data: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    fn is_dir(&self) -> bool {
        self.attr.mode.is_dir()
    }
}

struct Inner {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    next_fh: u64,
}

/// An in-memory filesystem backing the integration tests.
pub struct MemFs {
    inner: Mutex<Inner>,
    read_delay: Duration,
}

impl MemFs {
    pub fn new() -> MemFs {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO.0, Node::new_dir(ROOT_INO, 0o755));
        MemFs {
            inner: Mutex::new(Inner {
                nodes,
                next_ino: 2,
                next_fh: 1,
            }),
            read_delay: Duration::ZERO,
        }
    }

    /// Slows every read down, for cancellation tests.
    pub fn with_read_delay(mut self, delay: Duration) -> MemFs {
        self.read_delay = delay;
        self
    }

    /// Test setup shortcut bypassing the dispatcher.
    pub fn add_file(&self, parent: Ino, name: &str, data: &[u8]) -> Ino {
        let mut inner = self.inner.lock();
        let ino = Ino(inner.next_ino);
        inner.next_ino += 1;
        let mut node = Node::new_file(ino, Mode::from_parts(FileType::RegularFile, 0o644));
        node.data = data.to_vec();
        node.attr.size = data.len() as u64;
        inner.nodes.insert(ino.0, node);
        inner
            .nodes
            .get_mut(&parent.0)
            .expect("parent must exist")
            .children
            .insert(name.into(), ino);
        ino
    }

    fn entry_for(&self, ino: Ino) -> OpResult<Entry> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(&ino.0).ok_or(Errno::ENOENT)?;
        Ok(Entry::new(node.attr))
    }
}

impl FuseOps for MemFs {
    fn lookup(&self, _ctx: &RequestContext, parent: Ino, name: &OsStr) -> OpResult<Entry> {
        let ino = {
            let inner = self.inner.lock();
            let dir = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
            if !dir.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            *dir.children.get(name).ok_or(Errno::ENOENT)?
        };
        self.entry_for(ino)
    }

    fn getattr(&self, _ctx: &RequestContext, ino: Ino, _fi: Option<&FileInfo>) -> OpResult<AttrOut> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(&ino.0).ok_or(Errno::ENOENT)?;
        Ok(AttrOut::new(node.attr))
    }

    fn setattr(
        &self,
        _ctx: &RequestContext,
        ino: Ino,
        changes: &SetattrChanges,
        _fi: Option<&FileInfo>,
    ) -> OpResult<AttrOut> {
        let mut inner = self.inner.lock();
        let node = inner.nodes.get_mut(&ino.0).ok_or(Errno::ENOENT)?;
        if let Some(mode) = changes.mode {
            node.attr.mode = Mode(node.attr.mode.0 & libc::S_IFMT | mode.permissions());
        }
        if let Some(uid) = changes.uid {
            node.attr.uid = uid;
        }
        if let Some(gid) = changes.gid {
            node.attr.gid = gid;
        }
        if let Some(size) = changes.size {
            node.data.resize(size as usize, 0);
            node.attr.size = size;
        }
        if let Some(atime) = changes.atime {
            node.attr.atime = atime.resolve();
        }
        if let Some(mtime) = changes.mtime {
            node.attr.mtime = mtime.resolve();
        }
        Ok(AttrOut::new(node.attr))
    }

    fn mkdir(&self, _ctx: &RequestContext, parent: Ino, name: &OsStr, mode: Mode) -> OpResult<Entry> {
        let mut inner = self.inner.lock();
        let parent_node = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
        if !parent_node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if parent_node.children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let ino = Ino(inner.next_ino);
        inner.next_ino += 1;
        inner
            .nodes
            .insert(ino.0, Node::new_dir(ino, mode.permissions()));
        inner
            .nodes
            .get_mut(&parent.0)
            .expect("checked above")
            .children
            .insert(name.to_os_string(), ino);
        let node = &inner.nodes[&ino.0];
        Ok(Entry::new(node.attr))
    }

    fn create(
        &self,
        _ctx: &RequestContext,
        parent: Ino,
        name: &OsStr,
        mode: Mode,
        flags: OpenFlags,
    ) -> OpResult<(Entry, FileInfo)> {
        let mut inner = self.inner.lock();
        let parent_node = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
        if !parent_node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if parent_node.children.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let ino = Ino(inner.next_ino);
        let fh = Fd(inner.next_fh);
        inner.next_ino += 1;
        inner.next_fh += 1;
        inner.nodes.insert(ino.0, Node::new_file(ino, mode));
        inner
            .nodes
            .get_mut(&parent.0)
            .expect("checked above")
            .children
            .insert(name.to_os_string(), ino);
        let entry = Entry::new(inner.nodes[&ino.0].attr);
        Ok((entry, FileInfo::with_fh(fh, flags)))
    }

    fn open(&self, _ctx: &RequestContext, ino: Ino, flags: OpenFlags) -> OpResult<FileInfo> {
        let mut inner = self.inner.lock();
        if !inner.nodes.contains_key(&ino.0) {
            return Err(Errno::ENOENT);
        }
        let fh = Fd(inner.next_fh);
        inner.next_fh += 1;
        Ok(FileInfo::with_fh(fh, flags))
    }

    fn read(
        &self,
        _ctx: &RequestContext,
        ino: Ino,
        offset: u64,
        size: u32,
        _fi: &FileInfo,
    ) -> OpResult<fusebind::Bytes<'static>> {
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        let inner = self.inner.lock();
        let node = inner.nodes.get(&ino.0).ok_or(Errno::ENOENT)?;
        if node.is_dir() {
            return Err(Errno::EISDIR);
        }
        let start = (offset as usize).min(node.data.len());
        let end = (start + size as usize).min(node.data.len());
        Ok(fusebind::Bytes::Owned(node.data[start..end].to_vec()))
    }

    fn write(
        &self,
        _ctx: &RequestContext,
        ino: Ino,
        data: &[u8],
        offset: u64,
        _fi: &FileInfo,
        _flags: OpenFlags,
    ) -> OpResult<usize> {
        let mut inner = self.inner.lock();
        let node = inner.nodes.get_mut(&ino.0).ok_or(Errno::ENOENT)?;
        if node.is_dir() {
            return Err(Errno::EISDIR);
        }
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.attr.size = node.data.len() as u64;
        node.attr.mtime = TimeSpec::from_system_time(std::time::SystemTime::now());
        Ok(data.len())
    }

    fn flush(&self, _ctx: &RequestContext, _ino: Ino, _fi: &FileInfo) -> OpResult<()> {
        Ok(())
    }

    fn release(&self, _ctx: &RequestContext, _ino: Ino, _fi: &FileInfo) -> OpResult<()> {
        Ok(())
    }

    fn fsync(&self, _ctx: &RequestContext, _ino: Ino, _datasync: bool, _fi: &FileInfo) -> OpResult<()> {
        Ok(())
    }

    fn unlink(&self, _ctx: &RequestContext, parent: Ino, name: &OsStr) -> OpResult<()> {
        let mut inner = self.inner.lock();
        let target = {
            let dir = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
            *dir.children.get(name).ok_or(Errno::ENOENT)?
        };
        if inner.nodes[&target.0].is_dir() {
            return Err(Errno::EISDIR);
        }
        inner.nodes.remove(&target.0);
        inner
            .nodes
            .get_mut(&parent.0)
            .expect("parent looked up above")
            .children
            .remove(name);
        Ok(())
    }

    fn rmdir(&self, _ctx: &RequestContext, parent: Ino, name: &OsStr) -> OpResult<()> {
        let mut inner = self.inner.lock();
        let target = {
            let dir = inner.nodes.get(&parent.0).ok_or(Errno::ENOENT)?;
            *dir.children.get(name).ok_or(Errno::ENOENT)?
        };
        let node = inner.nodes.get(&target.0).ok_or(Errno::ENOENT)?;
        if !node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if !node.children.is_empty() {
            return Err(Errno::ENOTEMPTY);
        }
        inner.nodes.remove(&target.0);
        inner
            .nodes
            .get_mut(&parent.0)
            .expect("parent looked up above")
            .children
            .remove(name);
        Ok(())
    }

    fn opendir(&self, _ctx: &RequestContext, ino: Ino) -> OpResult<FileInfo> {
        let mut inner = self.inner.lock();
        let node = inner.nodes.get(&ino.0).ok_or(Errno::ENOENT)?;
        if !node.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let fh = Fd(inner.next_fh);
        inner.next_fh += 1;
        Ok(FileInfo::with_fh(fh, OpenFlags::empty()))
    }

    fn readdir(
        &self,
        _ctx: &RequestContext,
        ino: Ino,
        offset: u64,
        _fi: &FileInfo,
    ) -> OpResult<ReaddirOut> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(&ino.0).ok_or(Errno::ENOENT)?;
        if !node.is_dir() {
            return Err(Errno::ENOTDIR);
        }

        let mut listing = vec![
            DirEntry::new(".", ino, FileType::Directory),
            DirEntry::new("..", ROOT_INO, FileType::Directory),
        ];
        for (name, child_ino) in &node.children {
            let kind = inner.nodes[&child_ino.0].attr.mode.file_type();
            listing.push(DirEntry::new(name.clone(), *child_ino, kind));
        }

        let start = (offset as usize).min(listing.len());
        let end = (start + PAGE_SIZE).min(listing.len());
        Ok(ReaddirOut {
            entries: listing[start..end].to_vec(),
            has_more: end < listing.len(),
            next_offset: (end < listing.len()).then_some(end as u64),
        })
    }

    fn releasedir(&self, _ctx: &RequestContext, _ino: Ino, _fi: &FileInfo) -> OpResult<()> {
        Ok(())
    }

    fn statfs(&self, _ctx: &RequestContext, _ino: Ino) -> OpResult<fusebind::Statvfs> {
        let inner = self.inner.lock();
        Ok(fusebind::Statvfs {
            bsize: 4096,
            frsize: 4096,
            files: inner.nodes.len() as u64,
            namemax: 255,
            ..fusebind::Statvfs::default()
        })
    }
}

/// Root-owned attributes helper for assertions.
pub fn owned_by_root(attr: &FileAttr) -> bool {
    attr.uid == Uid(0) && attr.gid == Gid(0)
}
