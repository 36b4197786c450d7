//! 9P protocol data types and constants.
//!
//! The server side of this crate speaks 9P2000.L; the 9P2000 and 9P2000.u
//! variants are carried far enough to negotiate them and report errors in
//! their dialect.

use std::fs;
use std::os::unix::fs::MetadataExt;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// 9P2000.u version string
pub const P92000U: &str = "9P2000.u";

/// 9P2000.L version string
pub const P92000L: &str = "9P2000.L";

/// Version string returned in `Rversion` when the client's proposal is not
/// understood
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
pub const NOFID: u32 = !0;

/// Special uid which `Tauth`/`Tattach` use as `n_uname` when no numeric uid
/// accompanies the user name
pub const NONUNAME: u32 = !0;

/// Ample room for `Twrite`/`Rread` headers
///
/// size[4] type[1] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Room for the `Rreaddir` header
pub const READDIRHDRSZ: u32 = 24;

/// Maximum number of path elements in a single `Twalk`
pub const MAXWELEM: usize = 16;

/// v9fs default port
pub const V9FS_PORT: u16 = 564;

/// Negotiated protocol variant.
///
/// The variant changes how `Tauth`/`Tattach` and error responses are laid
/// out on the wire, so the codec needs it in hand when framing messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    /// Plain 9P2000: string errors, no numeric uids
    Legacy,
    /// 9P2000.u: string errors with an errno, numeric uids
    Unix,
    /// 9P2000.L: errno-only errors, Linux operation set
    Linux,
}

impl Protocol {
    /// Map a client's version string to a variant, if supported.
    pub fn negotiate(version: &str) -> Option<Protocol> {
        match version {
            P92000 => Some(Protocol::Legacy),
            P92000U => Some(Protocol::Unix),
            P92000L => Some(Protocol::Linux),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Legacy => P92000,
            Protocol::Unix => P92000U,
            Protocol::Linux => P92000L,
        }
    }

    /// `Tauth`/`Tattach` carry `n_uname` only under .u and .L.
    pub fn has_numeric_uids(&self) -> bool {
        !matches!(self, Protocol::Legacy)
    }
}

enum_from_primitive! {
    #[doc = "Lock type carried by `Tlock`/`Tgetlock`"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LockType {
        RdLock = 0,
        WrLock = 1,
        Unlock = 2,
    }
}

enum_from_primitive! {
    #[doc = "Result of a `Tlock` request"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LockStatus {
        Success = 0,
        Blocked = 1,
        Error = 2,
        Grace = 3,
    }
}

/// `Flock.flags` bit requesting a blocking lock
pub const LOCK_FLAG_BLOCK: u32 = 1;

/// `Flock.flags` bit reserved for lock reclaim after server restart
pub const LOCK_FLAG_RECLAIM: u32 = 2;

bitflags! {
    /// Bits in `Qid.typ`
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        #[doc = "Directories"]
        const DIR       = 0x80;
        #[doc = "Append-only files"]
        const APPEND    = 0x40;
        #[doc = "Exclusive-use files"]
        const EXCL      = 0x20;
        #[doc = "Mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Authentication file"]
        const AUTH      = 0x08;
        #[doc = "Non-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Symbolic link"]
        const SYMLINK   = 0x02;
        #[doc = "Hard link (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<&fs::FileType> for QidType {
    fn from(typ: &fs::FileType) -> Self {
        let mut qt = QidType::FILE;
        if typ.is_dir() {
            qt.insert(QidType::DIR);
        }
        if typ.is_symlink() {
            qt.insert(QidType::SYMLINK);
        }
        qt
    }
}

impl From<fs::FileType> for QidType {
    fn from(typ: fs::FileType) -> Self {
        From::from(&typ)
    }
}

bitflags! {
    /// Bits in `mask` and `valid` of `Tgetattr`/`Rgetattr`
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct GetattrMask: u64 {
        const MODE          = 0x00000001;
        const NLINK         = 0x00000002;
        const UID           = 0x00000004;
        const GID           = 0x00000008;
        const RDEV          = 0x00000010;
        const ATIME         = 0x00000020;
        const MTIME         = 0x00000040;
        const CTIME         = 0x00000080;
        const INO           = 0x00000100;
        const SIZE          = 0x00000200;
        const BLOCKS        = 0x00000400;

        const BTIME         = 0x00000800;
        const GEN           = 0x00001000;
        const DATA_VERSION  = 0x00002000;

        #[doc = "Fields up to BLOCKS"]
        const BASIC         = 0x000007ff;
        #[doc = "All fields"]
        const ALL           = 0x00003fff;
    }
}

bitflags! {
    /// Bits in `valid` of `Tsetattr`.
    ///
    /// If a time bit is set without the corresponding SET bit, the server's
    /// current time is used instead of the value sent in the request.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub struct SetattrMask: u32 {
        const MODE      = 0x00000001;
        const UID       = 0x00000002;
        const GID       = 0x00000004;
        const SIZE      = 0x00000008;
        const ATIME     = 0x00000010;
        const MTIME     = 0x00000020;
        const CTIME     = 0x00000040;
        const ATIME_SET = 0x00000080;
        const MTIME_SET = 0x00000100;
    }
}

/// Server-chosen identity triple for a file.
///
/// `path` is unique among all files served from one hierarchy and `version`
/// changes when the file is modified.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    /// Wire size: typ[1] version[4] path[8]
    pub const SIZE: u32 = 13;
}

/// Filesystem information corresponding to Linux `struct statfs`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Statfs {
    /// Type of the file system
    pub typ: u32,
    /// Optimal transfer block size
    pub bsize: u32,
    /// Total data blocks
    pub blocks: u64,
    /// Free blocks
    pub bfree: u64,
    /// Free blocks available to the unprivileged
    pub bavail: u64,
    /// Total file nodes
    pub files: u64,
    /// Free file nodes
    pub ffree: u64,
    /// Filesystem id
    pub fsid: u64,
    /// Maximum file name length
    pub namelen: u32,
}

impl From<nix::sys::statvfs::Statvfs> for Statfs {
    fn from(buf: nix::sys::statvfs::Statvfs) -> Statfs {
        Statfs {
            typ: 0,
            bsize: buf.block_size() as u32,
            blocks: buf.blocks(),
            bfree: buf.blocks_free(),
            bavail: buf.blocks_available(),
            files: buf.files(),
            ffree: buf.files_free(),
            fsid: buf.filesystem_id(),
            namelen: buf.name_max() as u32,
        }
    }
}

/// Seconds/nanoseconds pair used by `Stat` and `SetAttr`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Time {
    pub sec: u64,
    pub nsec: u64,
}

/// File attributes corresponding to Linux `struct stat`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
}

impl From<&fs::Metadata> for Stat {
    fn from(attr: &fs::Metadata) -> Self {
        Stat {
            mode: attr.mode(),
            uid: attr.uid(),
            gid: attr.gid(),
            nlink: attr.nlink(),
            rdev: attr.rdev(),
            size: attr.size(),
            blksize: attr.blksize(),
            blocks: attr.blocks(),
            atime: Time {
                sec: attr.atime() as u64,
                nsec: attr.atime_nsec() as u64,
            },
            mtime: Time {
                sec: attr.mtime() as u64,
                nsec: attr.mtime_nsec() as u64,
            },
            ctime: Time {
                sec: attr.ctime() as u64,
                nsec: attr.ctime_nsec() as u64,
            },
        }
    }
}

impl From<fs::Metadata> for Stat {
    fn from(attr: fs::Metadata) -> Self {
        From::from(&attr)
    }
}

/// Subset of `Stat` carried by `Tsetattr`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
}

/// One packed directory entry of `Rreaddir`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub qid: Qid,
    /// Cursor to resume reading after this entry
    pub offset: u64,
    /// `d_type` of `struct dirent`; 0 when unknown
    pub typ: u8,
    pub name: String,
}

impl DirEntry {
    /// Wire size: qid[13] offset[8] type[1] namelen[2] name[n]
    pub fn size(&self) -> u32 {
        Qid::SIZE + 8 + 1 + 2 + self.name.len() as u32
    }
}

/// The opaque `Rreaddir` payload: a packed run of directory entries
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntryData {
    pub entries: Vec<DirEntry>,
}

impl DirEntryData {
    pub fn new() -> DirEntryData {
        DirEntryData {
            entries: Vec::new(),
        }
    }

    pub fn with(entries: Vec<DirEntry>) -> DirEntryData {
        DirEntryData { entries }
    }

    pub fn size(&self) -> u32 {
        self.entries.iter().map(DirEntry::size).sum()
    }

    pub fn push(&mut self, entry: DirEntry) {
        self.entries.push(entry);
    }

    /// Cursor of the last packed entry, used to validate readdir
    /// resumption.
    pub fn last_offset(&self) -> Option<u64> {
        self.entries.last().map(|e| e.offset)
    }
}

/// Payload of `Rread` and `Twrite`
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

/// Advisory lock description, similar to Linux `struct flock`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Flock {
    pub typ: LockType,
    pub flags: u32,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

/// Lock query/answer carried by `Tgetlock`/`Rgetlock`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Getlock {
    pub typ: LockType,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

enum_from_primitive! {
    #[doc = "Message type byte of the 9P taxonomy"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        // 9P2000.L
        Rlerror         = 7,
        Tstatfs         = 8,
        Rstatfs,
        Tlopen          = 12,
        Rlopen,
        Tlcreate        = 14,
        Rlcreate,
        Tsymlink        = 16,
        Rsymlink,
        Tmknod          = 18,
        Rmknod,
        Trename         = 20,
        Rrename,
        Treadlink       = 22,
        Rreadlink,
        Tgetattr        = 24,
        Rgetattr,
        Tsetattr        = 26,
        Rsetattr,
        Txattrwalk      = 30,
        Rxattrwalk,
        Txattrcreate    = 32,
        Rxattrcreate,
        Treaddir        = 40,
        Rreaddir,
        Tfsync          = 50,
        Rfsync,
        Tlock           = 52,
        Rlock,
        Tgetlock        = 54,
        Rgetlock,
        Tlink           = 70,
        Rlink,
        Tmkdir          = 72,
        Rmkdir,
        Trenameat       = 74,
        Rrenameat,
        Tunlinkat       = 76,
        Runlinkat,

        // 9P2000 / 9P2000.u
        Tversion        = 100,
        Rversion,
        Tauth           = 102,
        Rauth,
        Tattach         = 104,
        Rattach,
        Rerror          = 107,
        Tflush          = 108,
        Rflush,
        Twalk           = 110,
        Rwalk,
        Tread           = 116,
        Rread,
        Twrite          = 118,
        Rwrite,
        Tclunk          = 120,
        Rclunk,
        Tremove         = 122,
        Rremove,
    }
}

impl MsgType {
    /// Whether this is a response type
    pub fn is_r(&self) -> bool {
        // responses are the odd-numbered half of the taxonomy
        (*self as u8) & 1 == 1
    }
}

impl From<&Fcall> for MsgType {
    fn from(fcall: &Fcall) -> MsgType {
        match fcall {
            Fcall::Rlerror { .. } => MsgType::Rlerror,
            Fcall::Tstatfs { .. } => MsgType::Tstatfs,
            Fcall::Rstatfs { .. } => MsgType::Rstatfs,
            Fcall::Tlopen { .. } => MsgType::Tlopen,
            Fcall::Rlopen { .. } => MsgType::Rlopen,
            Fcall::Tlcreate { .. } => MsgType::Tlcreate,
            Fcall::Rlcreate { .. } => MsgType::Rlcreate,
            Fcall::Tsymlink { .. } => MsgType::Tsymlink,
            Fcall::Rsymlink { .. } => MsgType::Rsymlink,
            Fcall::Tmknod { .. } => MsgType::Tmknod,
            Fcall::Rmknod { .. } => MsgType::Rmknod,
            Fcall::Trename { .. } => MsgType::Trename,
            Fcall::Rrename => MsgType::Rrename,
            Fcall::Treadlink { .. } => MsgType::Treadlink,
            Fcall::Rreadlink { .. } => MsgType::Rreadlink,
            Fcall::Tgetattr { .. } => MsgType::Tgetattr,
            Fcall::Rgetattr { .. } => MsgType::Rgetattr,
            Fcall::Tsetattr { .. } => MsgType::Tsetattr,
            Fcall::Rsetattr => MsgType::Rsetattr,
            Fcall::Txattrwalk { .. } => MsgType::Txattrwalk,
            Fcall::Rxattrwalk { .. } => MsgType::Rxattrwalk,
            Fcall::Txattrcreate { .. } => MsgType::Txattrcreate,
            Fcall::Rxattrcreate => MsgType::Rxattrcreate,
            Fcall::Treaddir { .. } => MsgType::Treaddir,
            Fcall::Rreaddir { .. } => MsgType::Rreaddir,
            Fcall::Tfsync { .. } => MsgType::Tfsync,
            Fcall::Rfsync => MsgType::Rfsync,
            Fcall::Tlock { .. } => MsgType::Tlock,
            Fcall::Rlock { .. } => MsgType::Rlock,
            Fcall::Tgetlock { .. } => MsgType::Tgetlock,
            Fcall::Rgetlock { .. } => MsgType::Rgetlock,
            Fcall::Tlink { .. } => MsgType::Tlink,
            Fcall::Rlink => MsgType::Rlink,
            Fcall::Tmkdir { .. } => MsgType::Tmkdir,
            Fcall::Rmkdir { .. } => MsgType::Rmkdir,
            Fcall::Trenameat { .. } => MsgType::Trenameat,
            Fcall::Rrenameat => MsgType::Rrenameat,
            Fcall::Tunlinkat { .. } => MsgType::Tunlinkat,
            Fcall::Runlinkat => MsgType::Runlinkat,
            Fcall::Tversion { .. } => MsgType::Tversion,
            Fcall::Rversion { .. } => MsgType::Rversion,
            Fcall::Tauth { .. } => MsgType::Tauth,
            Fcall::Rauth { .. } => MsgType::Rauth,
            Fcall::Tattach { .. } => MsgType::Tattach,
            Fcall::Rattach { .. } => MsgType::Rattach,
            Fcall::Rerror { .. } => MsgType::Rerror,
            Fcall::Tflush { .. } => MsgType::Tflush,
            Fcall::Rflush => MsgType::Rflush,
            Fcall::Twalk { .. } => MsgType::Twalk,
            Fcall::Rwalk { .. } => MsgType::Rwalk,
            Fcall::Tread { .. } => MsgType::Tread,
            Fcall::Rread { .. } => MsgType::Rread,
            Fcall::Twrite { .. } => MsgType::Twrite,
            Fcall::Rwrite { .. } => MsgType::Rwrite,
            Fcall::Tclunk { .. } => MsgType::Tclunk,
            Fcall::Rclunk => MsgType::Rclunk,
            Fcall::Tremove { .. } => MsgType::Tremove,
            Fcall::Rremove => MsgType::Rremove,
        }
    }
}

/// The various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fcall {
    // 9P2000.L
    Rlerror {
        ecode: u32,
    },
    Tstatfs {
        fid: u32,
    },
    Rstatfs {
        statfs: Statfs,
    },
    Tlopen {
        fid: u32,
        flags: u32,
    },
    Rlopen {
        qid: Qid,
        iounit: u32,
    },
    Tlcreate {
        fid: u32,
        name: String,
        flags: u32,
        mode: u32,
        gid: u32,
    },
    Rlcreate {
        qid: Qid,
        iounit: u32,
    },
    Tsymlink {
        fid: u32,
        name: String,
        symtgt: String,
        gid: u32,
    },
    Rsymlink {
        qid: Qid,
    },
    Tmknod {
        dfid: u32,
        name: String,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    },
    Rmknod {
        qid: Qid,
    },
    Trename {
        fid: u32,
        dfid: u32,
        name: String,
    },
    Rrename,
    Treadlink {
        fid: u32,
    },
    Rreadlink {
        target: String,
    },
    Tgetattr {
        fid: u32,
        req_mask: GetattrMask,
    },
    /// The reserved btime/gen/data_version members are zero-filled by the
    /// codec.
    Rgetattr {
        valid: GetattrMask,
        qid: Qid,
        stat: Stat,
    },
    Tsetattr {
        fid: u32,
        valid: SetattrMask,
        stat: SetAttr,
    },
    Rsetattr,
    Txattrwalk {
        fid: u32,
        newfid: u32,
        name: String,
    },
    Rxattrwalk {
        size: u64,
    },
    Txattrcreate {
        fid: u32,
        name: String,
        attr_size: u64,
        flags: u32,
    },
    Rxattrcreate,
    Treaddir {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rreaddir {
        data: DirEntryData,
    },
    Tfsync {
        fid: u32,
    },
    Rfsync,
    Tlock {
        fid: u32,
        flock: Flock,
    },
    Rlock {
        status: LockStatus,
    },
    Tgetlock {
        fid: u32,
        flock: Getlock,
    },
    Rgetlock {
        flock: Getlock,
    },
    Tlink {
        dfid: u32,
        fid: u32,
        name: String,
    },
    Rlink,
    Tmkdir {
        dfid: u32,
        name: String,
        mode: u32,
        gid: u32,
    },
    Rmkdir {
        qid: Qid,
    },
    Trenameat {
        olddirfid: u32,
        oldname: String,
        newdirfid: u32,
        newname: String,
    },
    Rrenameat,
    Tunlinkat {
        dirfd: u32,
        name: String,
        flags: u32,
    },
    Runlinkat,

    // 9P2000 / 9P2000.u
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    Rauth {
        aqid: Qid,
    },
    Tattach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    Rattach {
        qid: Qid,
    },
    /// Error response of the 9P2000 and 9P2000.u variants; `ecode` is on
    /// the wire only under 9P2000.u.
    Rerror {
        ename: String,
        ecode: u32,
    },
    Tflush {
        oldtag: u16,
    },
    Rflush,
    Twalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    Rwalk {
        wqids: Vec<Qid>,
    },
    Tread {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Data,
    },
    Twrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: u32,
    },
    Rclunk,
    Tremove {
        fid: u32,
    },
    Rremove,
}

/// Envelope pairing a message body with the tag correlating it to its
/// request
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    pub tag: u16,
    pub body: Fcall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_numbers_follow_the_taxonomy() {
        assert_eq!(MsgType::Rlerror as u8, 7);
        assert_eq!(MsgType::Tlopen as u8, 12);
        assert_eq!(MsgType::Treaddir as u8, 40);
        assert_eq!(MsgType::Tunlinkat as u8, 76);
        assert_eq!(MsgType::Tversion as u8, 100);
        assert_eq!(MsgType::Rerror as u8, 107);
        assert_eq!(MsgType::Tremove as u8, 122);
    }

    #[test]
    fn response_types_are_odd() {
        assert!(MsgType::Rversion.is_r());
        assert!(MsgType::Rlerror.is_r());
        assert!(!MsgType::Twalk.is_r());
        assert!(!MsgType::Tversion.is_r());
    }

    #[test]
    fn negotiate_known_versions() {
        assert_eq!(Protocol::negotiate("9P2000.L"), Some(Protocol::Linux));
        assert_eq!(Protocol::negotiate("9P2000.u"), Some(Protocol::Unix));
        assert_eq!(Protocol::negotiate("9P2000"), Some(Protocol::Legacy));
        assert_eq!(Protocol::negotiate("9P1999"), None);
        assert_eq!(Protocol::negotiate(""), None);
    }

    #[test]
    fn dir_entry_wire_size_counts_the_name() {
        let e = DirEntry {
            qid: Qid::default(),
            offset: 1,
            typ: 0,
            name: "hello".into(),
        };
        assert_eq!(e.size(), 13 + 8 + 1 + 2 + 5);

        let mut data = DirEntryData::new();
        assert_eq!(data.last_offset(), None);
        data.push(e.clone());
        data.push(DirEntry {
            offset: 7,
            ..e.clone()
        });
        assert_eq!(data.size(), 2 * e.size());
        assert_eq!(data.last_offset(), Some(7));
    }
}
