//! Host file-system backend.
//!
//! Every path-sensitive syscall batch runs on a blocking thread under an
//! [`IdentityGuard`](crate::ident::IdentityGuard), so access is checked by
//! the host kernel as the attaching user. I/O on already-open handles
//! (read, write, fsync) needs no identity; permission was checked at open.
//!
//! A fid's backing state is one of: a host path inside an export, a node
//! of the synthetic control namespace, or an extended-attribute snapshot.

use std::fs::ReadDir;
use std::io::SeekFrom;
use std::os::unix::fs::{DirEntryExt, MetadataExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use filetime::FileTime;
use log::info;
use nix::libc::{O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use nix::unistd::Gid;
use styx::error::{Error, errno::*};
use styx::srv::{Fid, Filesystem};
use styx::{
    Data, DirEntry, DirEntryData, Fcall, Flock, Getlock, GetattrMask, NONUNAME, Qid, SetAttr,
    SetattrMask,
};
use styx::Result;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

use crate::config::{Config, Export};
use crate::ctl::{self, CtlNode};
use crate::ident::Switcher;
use crate::lockmgr::LockMgr;
use crate::stats::Stats;
use crate::usermap::{self, UserRec};
use crate::utils::{dirent_type, qid_from_meta, xattrs};

// Clients are known to set flags that make no sense server side; the v9fs
// client propagates O_DIRECT, and O_DIRECT opens would then fail our own
// unaligned reads and writes. Only this set survives.
const ALLOWED_FLAGS: u32 =
    (O_RDONLY | O_WRONLY | O_RDWR | O_CREAT | O_TRUNC | O_APPEND | O_EXCL) as u32;

const WRITE_INTENT: u32 = (O_WRONLY | O_RDWR | O_CREAT | O_TRUNC | O_APPEND) as u32;

const XATTR_REPLACE: u32 = 0x2;

/// What a fid currently refers to.
#[derive(Default)]
enum FidState {
    #[default]
    Fresh,
    Host(HostRef),
    Ctl(CtlRef),
    Xattr(XattrRef),
}

#[derive(Clone)]
struct HostRef {
    export: Arc<Export>,
    user: Arc<UserRec>,
    path: PathBuf,
    lock_token: u64,
    locks: Arc<LockMgr>,
}

#[derive(Clone)]
struct CtlRef {
    node: CtlNode,
    /// Content snapshot taken at open; ctl reads are stable per open.
    content: Arc<Vec<u8>>,
}

struct XattrRef {
    user: Arc<UserRec>,
    path: PathBuf,
    /// Attribute value (or name list) snapshot for reads.
    value: Arc<Vec<u8>>,
    /// Accumulating write, applied when the fid is clunked.
    pending: Option<PendingXattr>,
}

struct PendingXattr {
    name: String,
    flags: u32,
    size: u64,
    buf: Vec<u8>,
}

/// Directory read cursor. Entry offsets are a 1-based sequence; "." and
/// ".." occupy the first two slots.
struct DirCursor {
    /// Sequence number of the next entry to hand out.
    next: u64,
    iter: ReadDir,
    /// Entry pulled from the iterator that did not fit the last reply.
    stashed: Option<DirEntry>,
    self_qid: Qid,
    parent_qid: Qid,
}

/// Per-fid backend state.
#[derive(Default)]
pub struct StyxFid {
    state: StdRwLock<FidState>,
    file: TokioMutex<Option<fs::File>>,
    dir: StdMutex<Option<DirCursor>>,
}

impl Drop for StyxFid {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let FidState::Host(h) = state {
                h.locks.release_token(h.lock_token);
            }
        }
    }
}

/// The exporter: maps 9P operations onto host directories listed in the
/// configuration, plus the reserved `ctl` namespace.
pub struct Styxfs {
    config: Arc<Config>,
    switcher: Arc<Switcher>,
    stats: Arc<Stats>,
    locks: Arc<LockMgr>,
}

impl Styxfs {
    pub fn new(config: Arc<Config>, switcher: Arc<Switcher>) -> Styxfs {
        Styxfs {
            config,
            switcher,
            stats: Arc::new(Stats::new()),
            locks: Arc::new(LockMgr::new()),
        }
    }

    /// Run `f` on a blocking thread with the user's identity adopted.
    async fn blocking<T, F>(&self, user: Arc<UserRec>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let switcher = self.switcher.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = switcher.assume(&user)?;
            f()
        })
        .await?
    }

    fn host_ref(&self, fid: &Fid<StyxFid>) -> Result<HostRef> {
        match &*fid.aux.state.read().unwrap() {
            FidState::Host(h) => {
                self.stats.count_tpool(&h.user.name, &h.export.aname);
                Ok(h.clone())
            }
            _ => Err(Error::No(EBADF)),
        }
    }

    fn new_host_ref(&self, parent: &HostRef, path: PathBuf) -> HostRef {
        HostRef {
            export: parent.export.clone(),
            user: parent.user.clone(),
            path,
            lock_token: self.locks.token(),
            locks: self.locks.clone(),
        }
    }

    /// Deny mutation of read-only exports.
    fn writable(&self, h: &HostRef) -> Result<()> {
        if h.export.read_only {
            Err(Error::No(EROFS))
        } else {
            Ok(())
        }
    }

    fn sync_dirs(&self) -> bool {
        self.config.sync_dirs
    }
}

fn checked_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        Err(Error::No(EINVAL))
    } else {
        Ok(name)
    }
}

/// Apply one walk component, clamping `..` at the export root so a client
/// can never escape its subtree.
fn step(root: &Path, path: &mut PathBuf, name: &str) {
    match name {
        "." => {}
        ".." => {
            if path.as_path() != root {
                path.pop();
            }
        }
        name => path.push(name),
    }
}

/// Created objects carry the gid the client asked for, provided the
/// creating user is actually a member of that group.
fn check_gid(user: &UserRec, gid: u32) -> Result<()> {
    usermap::group_by_gid(gid)?;
    if user.is_member(Gid::from_raw(gid)) {
        Ok(())
    } else {
        Err(Error::No(EPERM))
    }
}

/// Directory-mutating operations optionally persist the parent directory
/// before the response goes out.
fn fsync_parent(path: &Path) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

fn lstat_qid(path: &Path) -> Result<Qid> {
    Ok(qid_from_meta(&std::fs::symlink_metadata(path)?))
}

fn slice_at(buf: &[u8], offset: u64, count: u32) -> Vec<u8> {
    let start = (offset as usize).min(buf.len());
    let end = start + ((count as usize).min(buf.len() - start));
    buf[start..end].to_vec()
}

fn fill_dir(cursor: &mut DirCursor, count: u32) -> Result<DirEntryData> {
    let mut data = DirEntryData::new();
    loop {
        let entry = match cursor.stashed.take() {
            Some(entry) => entry,
            None => match cursor.next {
                1 => DirEntry {
                    qid: cursor.self_qid,
                    offset: 1,
                    typ: 4,
                    name: ".".to_owned(),
                },
                2 => DirEntry {
                    qid: cursor.parent_qid,
                    offset: 2,
                    typ: 4,
                    name: "..".to_owned(),
                },
                _ => match cursor.iter.next() {
                    None => break,
                    Some(entry) => {
                        let entry = entry?;
                        let typ = entry.file_type()?;
                        DirEntry {
                            qid: Qid {
                                typ: (&typ).into(),
                                version: 0,
                                path: entry.ino(),
                            },
                            offset: cursor.next,
                            typ: dirent_type(&typ),
                            name: entry.file_name().to_string_lossy().into_owned(),
                        }
                    }
                },
            },
        };

        if data.size() + entry.size() > count {
            cursor.stashed = Some(entry);
            break;
        }
        data.push(entry);
        cursor.next += 1;
    }
    Ok(data)
}

#[async_trait]
impl Filesystem for Styxfs {
    type Fid = StyxFid;

    async fn rattach(
        &self,
        fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<Fcall> {
        self.stats.count_op("attach");

        let user = {
            let uname = uname.to_owned();
            tokio::task::spawn_blocking(move || {
                if n_uname != NONUNAME {
                    usermap::user_by_uid(n_uname)
                } else {
                    usermap::user_by_name(&uname)
                }
            })
            .await??
        };

        if ctl::is_ctl_aname(aname) {
            *fid.aux.state.write().unwrap() = FidState::Ctl(CtlRef {
                node: CtlNode::Root,
                content: Arc::new(Vec::new()),
            });
            self.stats.count_attach();
            self.stats.count_tpool(&user.name, aname);
            return Ok(Fcall::Rattach {
                qid: CtlNode::Root.qid(),
            });
        }

        let export = self
            .config
            .find_export(aname)
            .cloned()
            .ok_or(Error::No(ENOENT))?;

        if export.private_port {
            // unix-domain peers have no port and are local by definition
            let privileged = fid.conn().peer().map(|p| p.port() < 1024).unwrap_or(true);
            if !privileged {
                return Err(Error::No(EPERM));
            }
        }

        let root = export.root.clone();
        let qid = {
            let user = user.clone();
            self.blocking(user, move || {
                let meta = std::fs::symlink_metadata(&root)?;
                if !meta.is_dir() {
                    return Err(Error::No(ENOTDIR));
                }
                Ok(qid_from_meta(&meta))
            })
            .await?
        };

        info!("attach user={} aname={}", user.name, aname);
        *fid.aux.state.write().unwrap() = FidState::Host(HostRef {
            path: export.root.clone(),
            export: Arc::new(export),
            user: user.clone(),
            lock_token: self.locks.token(),
            locks: self.locks.clone(),
        });
        self.stats.count_attach();
        self.stats.count_tpool(&user.name, aname);
        Ok(Fcall::Rattach { qid })
    }

    async fn rwalk(
        &self,
        fid: &Fid<Self::Fid>,
        newfid: &Fid<Self::Fid>,
        wnames: &[String],
    ) -> Result<Fcall> {
        self.stats.count_op("walk");

        enum Origin {
            Host(HostRef),
            Ctl(CtlNode),
        }
        let origin = match &*fid.aux.state.read().unwrap() {
            FidState::Host(h) => Origin::Host(h.clone()),
            FidState::Ctl(c) => Origin::Ctl(c.node),
            _ => return Err(Error::No(EBADF)),
        };

        match origin {
            Origin::Host(h) => {
                let root = h.export.root.clone();
                let start = h.path.clone();
                let names = wnames.to_vec();
                let (wqids, path) = self
                    .blocking(h.user.clone(), move || {
                        let mut path = start;
                        let mut wqids = Vec::new();
                        for (i, name) in names.iter().enumerate() {
                            checked_name(name)?;
                            step(&root, &mut path, name);
                            match std::fs::symlink_metadata(&path) {
                                Ok(meta) => wqids.push(qid_from_meta(&meta)),
                                Err(e) if i == 0 => return Err(e.into()),
                                Err(_) => break,
                            }
                        }
                        Ok((wqids, path))
                    })
                    .await?;

                if wqids.len() == wnames.len() {
                    *newfid.aux.state.write().unwrap() =
                        FidState::Host(self.new_host_ref(&h, path));
                }
                Ok(Fcall::Rwalk { wqids })
            }
            Origin::Ctl(start) => {
                let mut node = start;
                let mut wqids = Vec::new();
                for (i, name) in wnames.iter().enumerate() {
                    let next = match (node, name.as_str()) {
                        (node, ".") => Some(node),
                        (_, "..") => Some(CtlNode::Root),
                        (CtlNode::Root, name) => CtlNode::by_name(name),
                        (CtlNode::File(_), _) => {
                            if i == 0 {
                                return Err(Error::No(ENOTDIR));
                            }
                            None
                        }
                    };
                    match next {
                        Some(n) => {
                            node = n;
                            wqids.push(n.qid());
                        }
                        None if i == 0 => return Err(Error::No(ENOENT)),
                        None => break,
                    }
                }

                if wqids.len() == wnames.len() {
                    *newfid.aux.state.write().unwrap() = FidState::Ctl(CtlRef {
                        node,
                        content: Arc::new(Vec::new()),
                    });
                }
                Ok(Fcall::Rwalk { wqids })
            }
        }
    }

    async fn rlopen(&self, fid: &Fid<Self::Fid>, flags: u32) -> Result<Fcall> {
        self.stats.count_op("open");

        let ctl_node = match &*fid.aux.state.read().unwrap() {
            FidState::Host(_) => None,
            FidState::Ctl(c) => Some(c.node),
            _ => return Err(Error::No(EBADF)),
        };

        if let Some(node) = ctl_node {
            let qid = node.qid();
            if flags & WRITE_INTENT != 0 {
                return Err(Error::No(EROFS));
            }
            if !node.is_dir() {
                let content = Arc::new(ctl::render(node, &self.stats)?);
                *fid.aux.state.write().unwrap() = FidState::Ctl(CtlRef { node, content });
            }
            return Ok(Fcall::Rlopen {
                qid,
                iounit: fid.conn().iounit(),
            });
        }

        let h = self.host_ref(fid)?;
        if flags & WRITE_INTENT != 0 {
            self.writable(&h)?;
        }

        let path = h.path.clone();
        let (qid, file) = self
            .blocking(h.user.clone(), move || {
                let meta = std::fs::symlink_metadata(&path)?;
                let qid = qid_from_meta(&meta);
                if meta.is_dir() {
                    // directories are read via readdir on the path
                    return Ok((qid, None));
                }
                let oflags =
                    nix::fcntl::OFlag::from_bits_truncate((flags & ALLOWED_FLAGS) as i32);
                let fd = nix::fcntl::open(&path, oflags, nix::sys::stat::Mode::empty())?;
                Ok((qid, Some(std::fs::File::from(fd))))
            })
            .await?;

        if let Some(file) = file {
            *fid.aux.file.lock().await = Some(fs::File::from_std(file));
        }
        Ok(Fcall::Rlopen {
            qid,
            iounit: fid.conn().iounit(),
        })
    }

    async fn rlcreate(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        flags: u32,
        mode: u32,
        gid: u32,
    ) -> Result<Fcall> {
        self.stats.count_op("create");

        let h = self.host_ref(fid)?;
        self.writable(&h)?;
        checked_name(name)?;

        let path = h.path.join(name);
        let sync = self.sync_dirs();
        let (qid, file) = {
            let user = h.user.clone();
            let path = path.clone();
            self.blocking(h.user.clone(), move || {
                check_gid(&user, gid)?;
                let oflags =
                    nix::fcntl::OFlag::from_bits_truncate((flags & ALLOWED_FLAGS) as i32)
                        | nix::fcntl::OFlag::O_CREAT;
                let fd = nix::fcntl::open(
                    &path,
                    oflags,
                    nix::sys::stat::Mode::from_bits_truncate(mode),
                )?;
                let file = std::fs::File::from(fd);
                std::os::unix::fs::fchown(&file, None, Some(gid))?;
                let qid = qid_from_meta(&file.metadata()?);
                if sync {
                    fsync_parent(&path)?;
                }
                Ok((qid, file))
            })
            .await?
        };

        {
            let mut state = fid.aux.state.write().unwrap();
            *state = FidState::Host(self.new_host_ref(&h, path));
        }
        *fid.aux.file.lock().await = Some(fs::File::from_std(file));

        Ok(Fcall::Rlcreate {
            qid,
            iounit: fid.conn().iounit(),
        })
    }

    async fn rread(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<Fcall> {
        self.stats.count_op("read");

        let snapshot = match &*fid.aux.state.read().unwrap() {
            FidState::Host(_) => None,
            FidState::Ctl(c) => Some(c.content.clone()),
            FidState::Xattr(x) => Some(x.value.clone()),
            FidState::Fresh => return Err(Error::No(EBADF)),
        };

        if let Some(buf) = snapshot {
            return Ok(Fcall::Rread {
                data: Data(slice_at(&buf, offset, count)),
            });
        }

        let buf = {
            let mut file = fid.aux.file.lock().await;
            let file = file.as_mut().ok_or(Error::No(EBADF))?;
            file.seek(SeekFrom::Start(offset)).await?;

            let mut buf = vec![0; count as usize];
            let bytes = file.read(&mut buf[..]).await?;
            buf.truncate(bytes);
            buf
        };

        Ok(Fcall::Rread { data: Data(buf) })
    }

    async fn rwrite(&self, fid: &Fid<Self::Fid>, offset: u64, data: &Data) -> Result<Fcall> {
        self.stats.count_op("write");

        // xattr writes accumulate under the state lock, nothing blocks
        {
            let mut state = fid.aux.state.write().unwrap();
            match &mut *state {
                FidState::Host(_) => {}
                FidState::Xattr(x) => {
                    let pending = x.pending.as_mut().ok_or(Error::No(EACCES))?;
                    if offset != pending.buf.len() as u64 {
                        return Err(Error::No(EINVAL));
                    }
                    if pending.buf.len() + data.0.len() > pending.size as usize {
                        return Err(Error::No(ENOSPC));
                    }
                    pending.buf.extend_from_slice(&data.0);
                    return Ok(Fcall::Rwrite {
                        count: data.0.len() as u32,
                    });
                }
                FidState::Ctl(_) => return Err(Error::No(EPERM)),
                FidState::Fresh => return Err(Error::No(EBADF)),
            }
        }

        let count = {
            let mut file = fid.aux.file.lock().await;
            let file = file.as_mut().ok_or(Error::No(EBADF))?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write(&data.0).await? as u32
        };

        Ok(Fcall::Rwrite { count })
    }

    async fn rreaddir(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<Fcall> {
        self.stats.count_op("readdir");

        let h = match &*fid.aux.state.read().unwrap() {
            FidState::Host(h) => h.clone(),
            FidState::Ctl(c) if c.node.is_dir() => {
                return Ok(Fcall::Rreaddir {
                    data: ctl::readdir(offset, count),
                });
            }
            FidState::Ctl(_) => return Err(Error::No(ENOTDIR)),
            _ => return Err(Error::No(EBADF)),
        };

        let taken = fid.aux.dir.lock().unwrap().take();
        let root = h.export.root.clone();
        let path = h.path.clone();
        let (data, cursor) = self
            .blocking(h.user.clone(), move || {
                let mut cursor = if offset == 0 {
                    let parent = if path.as_path() == root.as_path() {
                        path.clone()
                    } else {
                        path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone())
                    };
                    DirCursor {
                        next: 1,
                        iter: std::fs::read_dir(&path)?,
                        stashed: None,
                        self_qid: lstat_qid(&path)?,
                        parent_qid: lstat_qid(&parent)?,
                    }
                } else {
                    // resumable only at the previous cursor position
                    match taken {
                        Some(c) if c.next == offset + 1 => c,
                        _ => return Err(Error::No(EINVAL)),
                    }
                };
                let data = fill_dir(&mut cursor, count)?;
                Ok((data, cursor))
            })
            .await?;

        *fid.aux.dir.lock().unwrap() = Some(cursor);
        Ok(Fcall::Rreaddir { data })
    }

    async fn rgetattr(&self, fid: &Fid<Self::Fid>, _req_mask: GetattrMask) -> Result<Fcall> {
        self.stats.count_op("getattr");

        match &*fid.aux.state.read().unwrap() {
            FidState::Ctl(c) => {
                let (valid, qid, stat) = c.node.stat(c.content.len() as u64);
                return Ok(Fcall::Rgetattr { valid, qid, stat });
            }
            FidState::Host(_) => {}
            _ => return Err(Error::No(EBADF)),
        }

        let h = self.host_ref(fid)?;
        let path = h.path.clone();
        let (qid, stat) = self
            .blocking(h.user.clone(), move || {
                let meta = std::fs::symlink_metadata(&path)?;
                Ok((qid_from_meta(&meta), styx::Stat::from(&meta)))
            })
            .await?;

        Ok(Fcall::Rgetattr {
            valid: GetattrMask::BASIC,
            qid,
            stat,
        })
    }

    async fn rsetattr(
        &self,
        fid: &Fid<Self::Fid>,
        valid: SetattrMask,
        stat: &SetAttr,
    ) -> Result<Fcall> {
        self.stats.count_op("setattr");

        let h = self.host_ref(fid)?;
        self.writable(&h)?;

        let path = h.path.clone();
        let stat = *stat;
        self.blocking(h.user.clone(), move || {
            if valid.contains(SetattrMask::MODE) {
                std::fs::set_permissions(&path, PermissionsExt::from_mode(stat.mode))?;
            }

            if valid.intersects(SetattrMask::UID | SetattrMask::GID) {
                let uid = valid.contains(SetattrMask::UID).then_some(stat.uid);
                let gid = valid.contains(SetattrMask::GID).then_some(stat.gid);
                std::os::unix::fs::lchown(&path, uid, gid)?;
            }

            if valid.contains(SetattrMask::SIZE) {
                std::fs::OpenOptions::new()
                    .write(true)
                    .open(&path)?
                    .set_len(stat.size)?;
            }

            if valid.intersects(SetattrMask::ATIME | SetattrMask::MTIME) {
                let meta = std::fs::metadata(&path)?;
                let atime = if valid.contains(SetattrMask::ATIME_SET) {
                    FileTime::from_unix_time(stat.atime.sec as i64, stat.atime.nsec as u32)
                } else if valid.contains(SetattrMask::ATIME) {
                    FileTime::now()
                } else {
                    FileTime::from_last_access_time(&meta)
                };
                let mtime = if valid.contains(SetattrMask::MTIME_SET) {
                    FileTime::from_unix_time(stat.mtime.sec as i64, stat.mtime.nsec as u32)
                } else if valid.contains(SetattrMask::MTIME) {
                    FileTime::now()
                } else {
                    FileTime::from_last_modification_time(&meta)
                };
                filetime::set_file_times(&path, atime, mtime)?;
            }

            Ok(())
        })
        .await?;

        Ok(Fcall::Rsetattr)
    }

    async fn rstatfs(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        self.stats.count_op("statfs");

        if let FidState::Ctl(_) = &*fid.aux.state.read().unwrap() {
            return Ok(Fcall::Rstatfs {
                statfs: styx::Statfs::default(),
            });
        }

        let h = self.host_ref(fid)?;
        let path = h.path.clone();
        let statfs = self
            .blocking(h.user.clone(), move || {
                Ok(styx::Statfs::from(nix::sys::statvfs::statvfs(&path)?))
            })
            .await?;

        Ok(Fcall::Rstatfs { statfs })
    }

    async fn rreadlink(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        self.stats.count_op("readlink");

        let h = self.host_ref(fid)?;
        let path = h.path.clone();
        let target = self
            .blocking(h.user.clone(), move || {
                Ok(std::fs::read_link(&path)?)
            })
            .await?;

        Ok(Fcall::Rreadlink {
            target: target.to_string_lossy().into_owned(),
        })
    }

    async fn rsymlink(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        symtgt: &str,
        gid: u32,
    ) -> Result<Fcall> {
        self.stats.count_op("symlink");

        let h = self.host_ref(fid)?;
        self.writable(&h)?;
        checked_name(name)?;

        let path = h.path.join(name);
        let target = symtgt.to_owned();
        let sync = self.sync_dirs();
        let user = h.user.clone();
        let qid = self
            .blocking(h.user.clone(), move || {
                check_gid(&user, gid)?;
                symlink(&target, &path)?;
                std::os::unix::fs::lchown(&path, None, Some(gid))?;
                let qid = lstat_qid(&path)?;
                if sync {
                    fsync_parent(&path)?;
                }
                Ok(qid)
            })
            .await?;

        Ok(Fcall::Rsymlink { qid })
    }

    async fn rmknod(
        &self,
        dfid: &Fid<Self::Fid>,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> Result<Fcall> {
        self.stats.count_op("mknod");

        let h = self.host_ref(dfid)?;
        self.writable(&h)?;
        checked_name(name)?;

        let path = h.path.join(name);
        let sync = self.sync_dirs();
        let user = h.user.clone();
        let qid = self
            .blocking(h.user.clone(), move || {
                check_gid(&user, gid)?;
                let kind = nix::sys::stat::SFlag::from_bits_truncate(mode);
                let perm = nix::sys::stat::Mode::from_bits_truncate(mode);
                let dev = nix::sys::stat::makedev(major as u64, minor as u64);
                nix::sys::stat::mknod(&path, kind, perm, dev)?;
                std::os::unix::fs::lchown(&path, None, Some(gid))?;
                let qid = lstat_qid(&path)?;
                if sync {
                    fsync_parent(&path)?;
                }
                Ok(qid)
            })
            .await?;

        Ok(Fcall::Rmknod { qid })
    }

    async fn rrename(
        &self,
        fid: &Fid<Self::Fid>,
        dfid: &Fid<Self::Fid>,
        name: &str,
    ) -> Result<Fcall> {
        self.stats.count_op("rename");

        let h = self.host_ref(fid)?;
        let dh = self.host_ref(dfid)?;
        self.writable(&h)?;
        checked_name(name)?;
        if h.export.aname != dh.export.aname {
            return Err(Error::No(EXDEV));
        }

        let oldpath = h.path.clone();
        let newpath = dh.path.join(name);
        let sync = self.sync_dirs();
        {
            let newpath = newpath.clone();
            self.blocking(h.user.clone(), move || {
                std::fs::rename(&oldpath, &newpath)?;
                if sync {
                    fsync_parent(&newpath)?;
                }
                Ok(())
            })
            .await?;
        }

        // the fid now refers to the file at its new location
        if let FidState::Host(h) = &mut *fid.aux.state.write().unwrap() {
            h.path = newpath;
        }
        Ok(Fcall::Rrename)
    }

    async fn rrenameat(
        &self,
        olddir: &Fid<Self::Fid>,
        oldname: &str,
        newdir: &Fid<Self::Fid>,
        newname: &str,
    ) -> Result<Fcall> {
        self.stats.count_op("renameat");

        let oh = self.host_ref(olddir)?;
        let nh = self.host_ref(newdir)?;
        self.writable(&oh)?;
        checked_name(oldname)?;
        checked_name(newname)?;
        if oh.export.aname != nh.export.aname {
            return Err(Error::No(EXDEV));
        }

        let oldpath = oh.path.join(oldname);
        let newpath = nh.path.join(newname);
        let sync = self.sync_dirs();
        self.blocking(oh.user.clone(), move || {
            std::fs::rename(&oldpath, &newpath)?;
            if sync {
                fsync_parent(&newpath)?;
            }
            Ok(())
        })
        .await?;

        Ok(Fcall::Rrenameat)
    }

    async fn rlink(
        &self,
        dfid: &Fid<Self::Fid>,
        fid: &Fid<Self::Fid>,
        name: &str,
    ) -> Result<Fcall> {
        self.stats.count_op("link");

        let dh = self.host_ref(dfid)?;
        let h = self.host_ref(fid)?;
        self.writable(&dh)?;
        checked_name(name)?;
        if h.export.aname != dh.export.aname {
            return Err(Error::No(EXDEV));
        }

        let original = h.path.clone();
        let link = dh.path.join(name);
        let sync = self.sync_dirs();
        self.blocking(dh.user.clone(), move || {
            std::fs::hard_link(&original, &link)?;
            if sync {
                fsync_parent(&link)?;
            }
            Ok(())
        })
        .await?;

        Ok(Fcall::Rlink)
    }

    async fn rmkdir(
        &self,
        dfid: &Fid<Self::Fid>,
        name: &str,
        mode: u32,
        gid: u32,
    ) -> Result<Fcall> {
        self.stats.count_op("mkdir");

        let h = self.host_ref(dfid)?;
        self.writable(&h)?;
        checked_name(name)?;

        let path = h.path.join(name);
        let sync = self.sync_dirs();
        let user = h.user.clone();
        let qid = self
            .blocking(h.user.clone(), move || {
                check_gid(&user, gid)?;
                std::fs::create_dir(&path)?;
                std::fs::set_permissions(&path, PermissionsExt::from_mode(mode & 0o7777))?;
                std::os::unix::fs::chown(&path, None, Some(gid))?;
                let qid = lstat_qid(&path)?;
                if sync {
                    fsync_parent(&path)?;
                }
                Ok(qid)
            })
            .await?;

        Ok(Fcall::Rmkdir { qid })
    }

    async fn runlinkat(&self, dirfid: &Fid<Self::Fid>, name: &str, flags: u32) -> Result<Fcall> {
        self.stats.count_op("unlinkat");

        let h = self.host_ref(dirfid)?;
        self.writable(&h)?;
        checked_name(name)?;

        let path = h.path.join(name);
        let rmdir = flags & (nix::libc::AT_REMOVEDIR as u32) != 0;
        let sync = self.sync_dirs();
        self.blocking(h.user.clone(), move || {
            if rmdir {
                std::fs::remove_dir(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            if sync {
                fsync_parent(&path)?;
            }
            Ok(())
        })
        .await?;

        Ok(Fcall::Runlinkat)
    }

    async fn rxattrwalk(
        &self,
        fid: &Fid<Self::Fid>,
        newfid: &Fid<Self::Fid>,
        name: &str,
    ) -> Result<Fcall> {
        self.stats.count_op("xattrwalk");

        let h = self.host_ref(fid)?;
        let path = h.path.clone();
        let name = name.to_owned();
        let value = self
            .blocking(h.user.clone(), move || {
                if name.is_empty() {
                    xattrs::list(&path)
                } else {
                    xattrs::get(&path, &name)
                }
            })
            .await?;

        let size = value.len() as u64;
        *newfid.aux.state.write().unwrap() = FidState::Xattr(XattrRef {
            user: h.user.clone(),
            path: h.path.clone(),
            value: Arc::new(value),
            pending: None,
        });

        Ok(Fcall::Rxattrwalk { size })
    }

    async fn rxattrcreate(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        attr_size: u64,
        flags: u32,
    ) -> Result<Fcall> {
        self.stats.count_op("xattrcreate");

        let h = self.host_ref(fid)?;
        self.writable(&h)?;
        if name.is_empty() {
            return Err(Error::No(EINVAL));
        }

        *fid.aux.state.write().unwrap() = FidState::Xattr(XattrRef {
            user: h.user.clone(),
            path: h.path.clone(),
            value: Arc::new(Vec::new()),
            pending: Some(PendingXattr {
                name: name.to_owned(),
                flags,
                size: attr_size,
                buf: Vec::new(),
            }),
        });

        Ok(Fcall::Rxattrcreate)
    }

    async fn rlock(&self, fid: &Fid<Self::Fid>, lock: &Flock) -> Result<Fcall> {
        self.stats.count_op("lock");

        let h = self.host_ref(fid)?;
        let path = h.path.clone();
        let key = self
            .blocking(h.user.clone(), move || {
                let meta = std::fs::symlink_metadata(&path)?;
                Ok((meta.dev(), meta.ino()))
            })
            .await?;

        let status = self.locks.lock(key, lock, h.lock_token);
        Ok(Fcall::Rlock { status })
    }

    async fn rgetlock(&self, fid: &Fid<Self::Fid>, lock: &Getlock) -> Result<Fcall> {
        self.stats.count_op("getlock");

        let h = self.host_ref(fid)?;
        let path = h.path.clone();
        let key = self
            .blocking(h.user.clone(), move || {
                let meta = std::fs::symlink_metadata(&path)?;
                Ok((meta.dev(), meta.ino()))
            })
            .await?;

        Ok(Fcall::Rgetlock {
            flock: self.locks.getlock(key, lock),
        })
    }

    async fn rfsync(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        self.stats.count_op("fsync");

        {
            let mut file = fid.aux.file.lock().await;
            file.as_mut().ok_or(Error::No(EBADF))?.sync_all().await?;
        }
        Ok(Fcall::Rfsync)
    }

    async fn rclunk(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        self.stats.count_op("clunk");

        // an xattrcreate fid applies its accumulated value now
        let pending = {
            let mut state = fid.aux.state.write().unwrap();
            match &mut *state {
                FidState::Xattr(x) => x
                    .pending
                    .take()
                    .map(|p| (x.user.clone(), x.path.clone(), p)),
                _ => None,
            }
        };

        if let Some((user, path, p)) = pending {
            if p.buf.len() as u64 != p.size {
                return Err(Error::No(EINVAL));
            }
            self.blocking(user, move || {
                if p.size == 0 && p.flags & XATTR_REPLACE != 0 {
                    // the client removes an attribute by replacing it
                    // with nothing
                    xattrs::remove(&path, &p.name)
                } else {
                    xattrs::set(&path, &p.name, &p.buf, p.flags)
                }
            })
            .await?;
        }

        Ok(Fcall::Rclunk)
    }

    async fn rremove(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        self.stats.count_op("remove");

        let h = match &*fid.aux.state.read().unwrap() {
            FidState::Host(h) => h.clone(),
            FidState::Ctl(_) => return Err(Error::No(EPERM)),
            _ => return Err(Error::No(EBADF)),
        };
        self.writable(&h)?;

        let path = h.path.clone();
        let sync = self.sync_dirs();
        self.blocking(h.user.clone(), move || {
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.is_dir() {
                std::fs::remove_dir(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            if sync {
                fsync_parent(&path)?;
            }
            Ok(())
        })
        .await?;

        Ok(Fcall::Rremove)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn walk_steps_clamp_at_the_export_root() {
        let root = PathBuf::from("/srv/export");
        let mut path = root.clone();

        step(&root, &mut path, "..");
        assert_eq!(path, root);

        step(&root, &mut path, "a");
        step(&root, &mut path, ".");
        assert_eq!(path, root.join("a"));

        step(&root, &mut path, "..");
        step(&root, &mut path, "..");
        assert_eq!(path, root);
    }

    #[test]
    fn names_with_separators_are_rejected() {
        assert!(checked_name("ok.txt").is_ok());
        assert!(checked_name("..").is_ok());
        assert!(checked_name("").is_err());
        assert!(checked_name("a/b").is_err());
        assert!(checked_name("a\0b").is_err());
    }

    #[test]
    fn gid_checks_demand_membership() {
        let user = UserRec {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(0),
            name: "tester".into(),
            groups: Vec::new(),
        };
        // group 0 exists and is the user's primary
        check_gid(&user, 0).unwrap();
        // not a member of an unrelated (likely nonexistent) group
        assert!(check_gid(&user, 4_000_000_000).is_err());
    }

    #[test]
    fn slice_at_clips_to_the_buffer() {
        let buf = b"0123456789";
        assert_eq!(slice_at(buf, 0, 4), b"0123");
        assert_eq!(slice_at(buf, 8, 10), b"89");
        assert_eq!(slice_at(buf, 20, 10), b"");
        assert_eq!(slice_at(buf, 0, 0), b"");
    }
}
