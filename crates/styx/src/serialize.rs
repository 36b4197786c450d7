//! Serialize/deserialize 9P messages into/from binary.
//!
//! Frames handed to [`read_msg`] and produced by [`write_msg`] omit the
//! leading size[4] field; the transport's length-delimited framing owns it.
//! The negotiated [`Protocol`] is required because `Tauth`/`Tattach` carry
//! `n_uname` only under 9P2000.u/.L and `Rerror` carries `ecode` only under
//! 9P2000.u.

use std::io::{self, Read, Result};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

use crate::fcall::*;

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

macro_rules! encode_all {
    ($w:expr; $($e:expr),* $(,)?) => {{
        let mut bytes = 0;
        $( bytes += Encodable::encode($e, $w)?; )*
        bytes
    }};
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and return the number of bytes written
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(1))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self).and(Ok(2))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self).and(Ok(4))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self).and(Ok(8))
    }
}

impl Encodable for str {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return Err(invalid_data("string too long"));
        }
        let bytes = (self.len() as u16).encode(w)?;
        w.write_all(self.as_bytes())?;
        Ok(bytes + self.len())
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_str().encode(w)
    }
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len = u16::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| invalid_data("invalid UTF-8 sequence"))
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(encode_all!(w; &self.typ.bits(), &self.version, &self.path))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: QidType::from_bits_truncate(u8::decode(r)?),
            version: u32::decode(r)?,
            path: u64::decode(r)?,
        })
    }
}

impl Encodable for Statfs {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(encode_all!(w;
            &self.typ, &self.bsize, &self.blocks, &self.bfree, &self.bavail,
            &self.files, &self.ffree, &self.fsid, &self.namelen))
    }
}

impl Decodable for Statfs {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Statfs {
            typ: u32::decode(r)?,
            bsize: u32::decode(r)?,
            blocks: u64::decode(r)?,
            bfree: u64::decode(r)?,
            bavail: u64::decode(r)?,
            files: u64::decode(r)?,
            ffree: u64::decode(r)?,
            fsid: u64::decode(r)?,
            namelen: u32::decode(r)?,
        })
    }
}

impl Encodable for Time {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(encode_all!(w; &self.sec, &self.nsec))
    }
}

impl Decodable for Time {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Time {
            sec: u64::decode(r)?,
            nsec: u64::decode(r)?,
        })
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(encode_all!(w;
            &self.mode, &self.uid, &self.gid, &self.nlink, &self.rdev,
            &self.size, &self.blksize, &self.blocks,
            &self.atime, &self.mtime, &self.ctime))
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Stat {
            mode: u32::decode(r)?,
            uid: u32::decode(r)?,
            gid: u32::decode(r)?,
            nlink: u64::decode(r)?,
            rdev: u64::decode(r)?,
            size: u64::decode(r)?,
            blksize: u64::decode(r)?,
            blocks: u64::decode(r)?,
            atime: Time::decode(r)?,
            mtime: Time::decode(r)?,
            ctime: Time::decode(r)?,
        })
    }
}

impl Encodable for SetAttr {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(encode_all!(w;
            &self.mode, &self.uid, &self.gid, &self.size,
            &self.atime, &self.mtime))
    }
}

impl Decodable for SetAttr {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(SetAttr {
            mode: u32::decode(r)?,
            uid: u32::decode(r)?,
            gid: u32::decode(r)?,
            size: u64::decode(r)?,
            atime: Time::decode(r)?,
            mtime: Time::decode(r)?,
        })
    }
}

impl Encodable for DirEntry {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(encode_all!(w; &self.qid, &self.offset, &self.typ, &self.name))
    }
}

impl Decodable for DirEntry {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(DirEntry {
            qid: Qid::decode(r)?,
            offset: u64::decode(r)?,
            typ: u8::decode(r)?,
            name: String::decode(r)?,
        })
    }
}

// The count prefix of the readdir payload is its byte length, not an entry
// count; entries are packed until the buffer runs out.
impl Encodable for DirEntryData {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = self.size().encode(w)?;
        for entry in &self.entries {
            bytes += entry.encode(w)?;
        }
        Ok(bytes)
    }
}

impl Decodable for DirEntryData {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let count = u32::decode(r)?;
        let buf = read_exact(r, count as usize)?;
        let mut cursor = io::Cursor::new(&buf[..]);
        let mut entries = Vec::new();
        while (cursor.position() as usize) < buf.len() {
            entries.push(DirEntry::decode(&mut cursor)?);
        }
        Ok(DirEntryData::with(entries))
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let bytes = (self.0.len() as u32).encode(w)?;
        w.write_all(&self.0)?;
        Ok(bytes + self.0.len())
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len = u32::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl Encodable for Flock {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(encode_all!(w;
            &(self.typ as u8), &self.flags, &self.start, &self.length,
            &self.proc_id, &self.client_id))
    }
}

impl Decodable for Flock {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Flock {
            typ: LockType::from_u8(u8::decode(r)?)
                .ok_or_else(|| invalid_data("invalid lock type"))?,
            flags: u32::decode(r)?,
            start: u64::decode(r)?,
            length: u64::decode(r)?,
            proc_id: u32::decode(r)?,
            client_id: String::decode(r)?,
        })
    }
}

impl Encodable for Getlock {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        Ok(encode_all!(w;
            &(self.typ as u8), &self.start, &self.length,
            &self.proc_id, &self.client_id))
    }
}

impl Decodable for Getlock {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Getlock {
            typ: LockType::from_u8(u8::decode(r)?)
                .ok_or_else(|| invalid_data("invalid lock type"))?,
            start: u64::decode(r)?,
            length: u64::decode(r)?,
            proc_id: u32::decode(r)?,
            client_id: String::decode(r)?,
        })
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        for item in self {
            bytes += item.encode(w)?;
        }
        Ok(bytes)
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len = u16::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(T::decode(r)?);
        }
        Ok(buf)
    }
}

/// Write a 9P message (without the size[4] prefix) into a byte-oriented
/// stream, returning the number of bytes written.
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg, proto: Protocol) -> Result<usize> {
    use crate::fcall::Fcall::*;

    let typ = MsgType::from(&msg.body);
    let mut bytes = encode_all!(w; &(typ as u8), &msg.tag);

    bytes += match &msg.body {
        Rlerror { ecode } => encode_all!(w; ecode),
        Tstatfs { fid } => encode_all!(w; fid),
        Rstatfs { statfs } => encode_all!(w; statfs),
        Tlopen { fid, flags } => encode_all!(w; fid, flags),
        Rlopen { qid, iounit } => encode_all!(w; qid, iounit),
        Tlcreate {
            fid,
            name,
            flags,
            mode,
            gid,
        } => encode_all!(w; fid, name, flags, mode, gid),
        Rlcreate { qid, iounit } => encode_all!(w; qid, iounit),
        Tsymlink {
            fid,
            name,
            symtgt,
            gid,
        } => encode_all!(w; fid, name, symtgt, gid),
        Rsymlink { qid } => encode_all!(w; qid),
        Tmknod {
            dfid,
            name,
            mode,
            major,
            minor,
            gid,
        } => encode_all!(w; dfid, name, mode, major, minor, gid),
        Rmknod { qid } => encode_all!(w; qid),
        Trename { fid, dfid, name } => encode_all!(w; fid, dfid, name),
        Rrename => 0,
        Treadlink { fid } => encode_all!(w; fid),
        Rreadlink { target } => encode_all!(w; target),
        Tgetattr { fid, req_mask } => encode_all!(w; fid, &req_mask.bits()),
        Rgetattr { valid, qid, stat } => {
            // trailing btime/gen/data_version members are reserved
            encode_all!(w; &valid.bits(), qid, stat, &0u64, &0u64, &0u64, &0u64)
        }
        Tsetattr { fid, valid, stat } => encode_all!(w; fid, &valid.bits(), stat),
        Rsetattr => 0,
        Txattrwalk { fid, newfid, name } => encode_all!(w; fid, newfid, name),
        Rxattrwalk { size } => encode_all!(w; size),
        Txattrcreate {
            fid,
            name,
            attr_size,
            flags,
        } => encode_all!(w; fid, name, attr_size, flags),
        Rxattrcreate => 0,
        Treaddir { fid, offset, count } => encode_all!(w; fid, offset, count),
        Rreaddir { data } => encode_all!(w; data),
        Tfsync { fid } => encode_all!(w; fid),
        Rfsync => 0,
        Tlock { fid, flock } => encode_all!(w; fid, flock),
        Rlock { status } => encode_all!(w; &(*status as u8)),
        Tgetlock { fid, flock } => encode_all!(w; fid, flock),
        Rgetlock { flock } => encode_all!(w; flock),
        Tlink { dfid, fid, name } => encode_all!(w; dfid, fid, name),
        Rlink => 0,
        Tmkdir {
            dfid,
            name,
            mode,
            gid,
        } => encode_all!(w; dfid, name, mode, gid),
        Rmkdir { qid } => encode_all!(w; qid),
        Trenameat {
            olddirfid,
            oldname,
            newdirfid,
            newname,
        } => encode_all!(w; olddirfid, oldname, newdirfid, newname),
        Rrenameat => 0,
        Tunlinkat { dirfd, name, flags } => encode_all!(w; dirfd, name, flags),
        Runlinkat => 0,

        Tversion { msize, version } => encode_all!(w; msize, version),
        Rversion { msize, version } => encode_all!(w; msize, version),
        Tauth {
            afid,
            uname,
            aname,
            n_uname,
        } => {
            let mut b = encode_all!(w; afid, uname, aname);
            if proto.has_numeric_uids() {
                b += encode_all!(w; n_uname);
            }
            b
        }
        Rauth { aqid } => encode_all!(w; aqid),
        Tattach {
            fid,
            afid,
            uname,
            aname,
            n_uname,
        } => {
            let mut b = encode_all!(w; fid, afid, uname, aname);
            if proto.has_numeric_uids() {
                b += encode_all!(w; n_uname);
            }
            b
        }
        Rattach { qid } => encode_all!(w; qid),
        Rerror { ename, ecode } => {
            let mut b = encode_all!(w; ename);
            if proto == Protocol::Unix {
                b += encode_all!(w; ecode);
            }
            b
        }
        Tflush { oldtag } => encode_all!(w; oldtag),
        Rflush => 0,
        Twalk {
            fid,
            newfid,
            wnames,
        } => encode_all!(w; fid, newfid, wnames),
        Rwalk { wqids } => encode_all!(w; wqids),
        Tread { fid, offset, count } => encode_all!(w; fid, offset, count),
        Rread { data } => encode_all!(w; data),
        Twrite { fid, offset, data } => encode_all!(w; fid, offset, data),
        Rwrite { count } => encode_all!(w; count),
        Tclunk { fid } => encode_all!(w; fid),
        Rclunk => 0,
        Tremove { fid } => encode_all!(w; fid),
        Rremove => 0,
    };

    Ok(bytes)
}

/// Read a 9P message (without the size[4] prefix) from a byte-oriented
/// stream.
pub fn read_msg<R: ReadBytesExt>(r: &mut R, proto: Protocol) -> Result<Msg> {
    use crate::fcall::MsgType::*;

    let msg_type = MsgType::from_u8(u8::decode(r)?);
    let tag = u16::decode(r)?;
    let body = match msg_type {
        Some(Rlerror) => Fcall::Rlerror {
            ecode: u32::decode(r)?,
        },
        Some(Tstatfs) => Fcall::Tstatfs {
            fid: u32::decode(r)?,
        },
        Some(Rstatfs) => Fcall::Rstatfs {
            statfs: Statfs::decode(r)?,
        },
        Some(Tlopen) => Fcall::Tlopen {
            fid: u32::decode(r)?,
            flags: u32::decode(r)?,
        },
        Some(Rlopen) => Fcall::Rlopen {
            qid: Qid::decode(r)?,
            iounit: u32::decode(r)?,
        },
        Some(Tlcreate) => Fcall::Tlcreate {
            fid: u32::decode(r)?,
            name: String::decode(r)?,
            flags: u32::decode(r)?,
            mode: u32::decode(r)?,
            gid: u32::decode(r)?,
        },
        Some(Rlcreate) => Fcall::Rlcreate {
            qid: Qid::decode(r)?,
            iounit: u32::decode(r)?,
        },
        Some(Tsymlink) => Fcall::Tsymlink {
            fid: u32::decode(r)?,
            name: String::decode(r)?,
            symtgt: String::decode(r)?,
            gid: u32::decode(r)?,
        },
        Some(Rsymlink) => Fcall::Rsymlink {
            qid: Qid::decode(r)?,
        },
        Some(Tmknod) => Fcall::Tmknod {
            dfid: u32::decode(r)?,
            name: String::decode(r)?,
            mode: u32::decode(r)?,
            major: u32::decode(r)?,
            minor: u32::decode(r)?,
            gid: u32::decode(r)?,
        },
        Some(Rmknod) => Fcall::Rmknod {
            qid: Qid::decode(r)?,
        },
        Some(Trename) => Fcall::Trename {
            fid: u32::decode(r)?,
            dfid: u32::decode(r)?,
            name: String::decode(r)?,
        },
        Some(Rrename) => Fcall::Rrename,
        Some(Treadlink) => Fcall::Treadlink {
            fid: u32::decode(r)?,
        },
        Some(Rreadlink) => Fcall::Rreadlink {
            target: String::decode(r)?,
        },
        Some(Tgetattr) => Fcall::Tgetattr {
            fid: u32::decode(r)?,
            req_mask: GetattrMask::from_bits_truncate(u64::decode(r)?),
        },
        Some(Rgetattr) => {
            let msg = Fcall::Rgetattr {
                valid: GetattrMask::from_bits_truncate(u64::decode(r)?),
                qid: Qid::decode(r)?,
                stat: Stat::decode(r)?,
            };
            let (_btime, _gen, _ver) = (Time::decode(r)?, u64::decode(r)?, u64::decode(r)?);
            msg
        }
        Some(Tsetattr) => Fcall::Tsetattr {
            fid: u32::decode(r)?,
            valid: SetattrMask::from_bits_truncate(u32::decode(r)?),
            stat: SetAttr::decode(r)?,
        },
        Some(Rsetattr) => Fcall::Rsetattr,
        Some(Txattrwalk) => Fcall::Txattrwalk {
            fid: u32::decode(r)?,
            newfid: u32::decode(r)?,
            name: String::decode(r)?,
        },
        Some(Rxattrwalk) => Fcall::Rxattrwalk {
            size: u64::decode(r)?,
        },
        Some(Txattrcreate) => Fcall::Txattrcreate {
            fid: u32::decode(r)?,
            name: String::decode(r)?,
            attr_size: u64::decode(r)?,
            flags: u32::decode(r)?,
        },
        Some(Rxattrcreate) => Fcall::Rxattrcreate,
        Some(Treaddir) => Fcall::Treaddir {
            fid: u32::decode(r)?,
            offset: u64::decode(r)?,
            count: u32::decode(r)?,
        },
        Some(Rreaddir) => Fcall::Rreaddir {
            data: DirEntryData::decode(r)?,
        },
        Some(Tfsync) => Fcall::Tfsync {
            fid: u32::decode(r)?,
        },
        Some(Rfsync) => Fcall::Rfsync,
        Some(Tlock) => Fcall::Tlock {
            fid: u32::decode(r)?,
            flock: Flock::decode(r)?,
        },
        Some(Rlock) => Fcall::Rlock {
            status: LockStatus::from_u8(u8::decode(r)?)
                .ok_or_else(|| invalid_data("invalid lock status"))?,
        },
        Some(Tgetlock) => Fcall::Tgetlock {
            fid: u32::decode(r)?,
            flock: Getlock::decode(r)?,
        },
        Some(Rgetlock) => Fcall::Rgetlock {
            flock: Getlock::decode(r)?,
        },
        Some(Tlink) => Fcall::Tlink {
            dfid: u32::decode(r)?,
            fid: u32::decode(r)?,
            name: String::decode(r)?,
        },
        Some(Rlink) => Fcall::Rlink,
        Some(Tmkdir) => Fcall::Tmkdir {
            dfid: u32::decode(r)?,
            name: String::decode(r)?,
            mode: u32::decode(r)?,
            gid: u32::decode(r)?,
        },
        Some(Rmkdir) => Fcall::Rmkdir {
            qid: Qid::decode(r)?,
        },
        Some(Trenameat) => Fcall::Trenameat {
            olddirfid: u32::decode(r)?,
            oldname: String::decode(r)?,
            newdirfid: u32::decode(r)?,
            newname: String::decode(r)?,
        },
        Some(Rrenameat) => Fcall::Rrenameat,
        Some(Tunlinkat) => Fcall::Tunlinkat {
            dirfd: u32::decode(r)?,
            name: String::decode(r)?,
            flags: u32::decode(r)?,
        },
        Some(Runlinkat) => Fcall::Runlinkat,

        Some(Tversion) => Fcall::Tversion {
            msize: u32::decode(r)?,
            version: String::decode(r)?,
        },
        Some(Rversion) => Fcall::Rversion {
            msize: u32::decode(r)?,
            version: String::decode(r)?,
        },
        Some(Tauth) => Fcall::Tauth {
            afid: u32::decode(r)?,
            uname: String::decode(r)?,
            aname: String::decode(r)?,
            n_uname: if proto.has_numeric_uids() {
                u32::decode(r)?
            } else {
                NONUNAME
            },
        },
        Some(Rauth) => Fcall::Rauth {
            aqid: Qid::decode(r)?,
        },
        Some(Tattach) => Fcall::Tattach {
            fid: u32::decode(r)?,
            afid: u32::decode(r)?,
            uname: String::decode(r)?,
            aname: String::decode(r)?,
            n_uname: if proto.has_numeric_uids() {
                u32::decode(r)?
            } else {
                NONUNAME
            },
        },
        Some(Rattach) => Fcall::Rattach {
            qid: Qid::decode(r)?,
        },
        Some(Rerror) => Fcall::Rerror {
            ename: String::decode(r)?,
            ecode: if proto == Protocol::Unix {
                u32::decode(r)?
            } else {
                0
            },
        },
        Some(Tflush) => Fcall::Tflush {
            oldtag: u16::decode(r)?,
        },
        Some(Rflush) => Fcall::Rflush,
        Some(Twalk) => Fcall::Twalk {
            fid: u32::decode(r)?,
            newfid: u32::decode(r)?,
            wnames: Vec::decode(r)?,
        },
        Some(Rwalk) => Fcall::Rwalk {
            wqids: Vec::decode(r)?,
        },
        Some(Tread) => Fcall::Tread {
            fid: u32::decode(r)?,
            offset: u64::decode(r)?,
            count: u32::decode(r)?,
        },
        Some(Rread) => Fcall::Rread {
            data: Data::decode(r)?,
        },
        Some(Twrite) => Fcall::Twrite {
            fid: u32::decode(r)?,
            offset: u64::decode(r)?,
            data: Data::decode(r)?,
        },
        Some(Rwrite) => Fcall::Rwrite {
            count: u32::decode(r)?,
        },
        Some(Tclunk) => Fcall::Tclunk {
            fid: u32::decode(r)?,
        },
        Some(Rclunk) => Fcall::Rclunk,
        Some(Tremove) => Fcall::Tremove {
            fid: u32::decode(r)?,
        },
        Some(Rremove) => Fcall::Rremove,
        None => return Err(invalid_data("invalid message type")),
    };

    Ok(Msg { tag, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(msg: Msg, proto: Protocol) -> Msg {
        let mut buf = Vec::new();
        let bytes = write_msg(&mut buf, &msg, proto).unwrap();
        assert_eq!(bytes, buf.len());
        read_msg(&mut Cursor::new(buf), proto).unwrap()
    }

    #[test]
    fn version_roundtrip() {
        let msg = Msg {
            tag: NOTAG,
            body: Fcall::Rversion {
                msize: 8192,
                version: P92000L.to_owned(),
            },
        };
        assert_eq!(roundtrip(msg.clone(), Protocol::Linux), msg);
    }

    #[test]
    fn walk_roundtrip_preserves_names_and_qids() {
        let msg = Msg {
            tag: 3,
            body: Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["alice".to_owned(), "notes.txt".to_owned()],
            },
        };
        assert_eq!(roundtrip(msg.clone(), Protocol::Linux), msg);

        let msg = Msg {
            tag: 3,
            body: Fcall::Rwalk {
                wqids: vec![
                    Qid {
                        typ: QidType::DIR,
                        version: 1,
                        path: 42,
                    },
                    Qid {
                        typ: QidType::FILE,
                        version: 7,
                        path: 43,
                    },
                ],
            },
        };
        assert_eq!(roundtrip(msg.clone(), Protocol::Linux), msg);
    }

    #[test]
    fn getattr_skips_reserved_members() {
        let msg = Msg {
            tag: 9,
            body: Fcall::Rgetattr {
                valid: GetattrMask::BASIC,
                qid: Qid {
                    typ: QidType::FILE,
                    version: 0,
                    path: 77,
                },
                stat: Stat {
                    mode: 0o644,
                    uid: 1000,
                    gid: 1000,
                    nlink: 1,
                    rdev: 0,
                    size: 4096,
                    blksize: 4096,
                    blocks: 8,
                    atime: Time { sec: 1, nsec: 2 },
                    mtime: Time { sec: 3, nsec: 4 },
                    ctime: Time { sec: 5, nsec: 6 },
                },
            },
        };
        assert_eq!(roundtrip(msg.clone(), Protocol::Linux), msg);
    }

    #[test]
    fn readdir_payload_is_byte_counted() {
        let entry = |name: &str, offset| DirEntry {
            qid: Qid::default(),
            offset,
            typ: 0,
            name: name.to_owned(),
        };
        let data = DirEntryData::with(vec![entry(".", 1), entry("..", 2), entry("file", 3)]);
        let size = data.size();

        let mut buf = Vec::new();
        data.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 4 + size as usize);
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), size);

        let decoded = DirEntryData::decode(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn attach_n_uname_depends_on_variant() {
        let msg = Msg {
            tag: 1,
            body: Fcall::Tattach {
                fid: 0,
                afid: NOFID,
                uname: "alice".to_owned(),
                aname: "/home".to_owned(),
                n_uname: 1000,
            },
        };

        let mut linux = Vec::new();
        write_msg(&mut linux, &msg, Protocol::Linux).unwrap();
        let mut legacy = Vec::new();
        write_msg(&mut legacy, &msg, Protocol::Legacy).unwrap();
        assert_eq!(linux.len(), legacy.len() + 4);

        let decoded = read_msg(&mut Cursor::new(legacy), Protocol::Legacy).unwrap();
        match decoded.body {
            Fcall::Tattach { n_uname, .. } => assert_eq!(n_uname, NONUNAME),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn rerror_ecode_only_under_dot_u() {
        let msg = Msg {
            tag: 5,
            body: Fcall::Rerror {
                ename: "permission denied".to_owned(),
                ecode: 1,
            },
        };

        let mut unix = Vec::new();
        write_msg(&mut unix, &msg, Protocol::Unix).unwrap();
        let mut legacy = Vec::new();
        write_msg(&mut legacy, &msg, Protocol::Legacy).unwrap();
        assert_eq!(unix.len(), legacy.len() + 4);

        assert_eq!(roundtrip(msg.clone(), Protocol::Unix), msg);
    }

    #[test]
    fn lock_messages_roundtrip() {
        let msg = Msg {
            tag: 2,
            body: Fcall::Tlock {
                fid: 4,
                flock: Flock {
                    typ: LockType::WrLock,
                    flags: LOCK_FLAG_BLOCK,
                    start: 0,
                    length: 0,
                    proc_id: 1234,
                    client_id: "node7".to_owned(),
                },
            },
        };
        assert_eq!(roundtrip(msg.clone(), Protocol::Linux), msg);

        let msg = Msg {
            tag: 2,
            body: Fcall::Rlock {
                status: LockStatus::Blocked,
            },
        };
        assert_eq!(roundtrip(msg.clone(), Protocol::Linux), msg);
    }

    #[test]
    fn truncated_frames_fail_to_decode() {
        let msg = Msg {
            tag: 11,
            body: Fcall::Twrite {
                fid: 2,
                offset: 1024,
                data: Data(vec![0xa5; 64]),
            },
        };
        let mut buf = Vec::new();
        write_msg(&mut buf, &msg, Protocol::Linux).unwrap();

        // every strict prefix must be rejected, never silently truncated
        for cut in 1..buf.len() {
            let r = read_msg(&mut Cursor::new(&buf[..cut]), Protocol::Linux);
            assert!(r.is_err(), "decode of {}-byte prefix should fail", cut);
        }
    }

    #[test]
    fn unknown_type_byte_is_refused() {
        // 6 is the illegal Tlerror slot
        let buf = vec![6u8, 0, 0];
        assert!(read_msg(&mut Cursor::new(buf), Protocol::Linux).is_err());
        let buf = vec![200u8, 0, 0];
        assert!(read_msg(&mut Cursor::new(buf), Protocol::Linux).is_err());
    }

    #[test]
    fn non_utf8_strings_are_refused() {
        // Tversion with a 2-byte string of invalid UTF-8
        let mut buf = vec![100u8, 0, 0];
        buf.extend_from_slice(&8192u32.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&[0xff, 0xfe]);
        assert!(read_msg(&mut Cursor::new(buf), Protocol::Linux).is_err());
    }
}
