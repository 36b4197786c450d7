//! Host-filesystem helpers: qid derivation and the xattr syscalls nix
//! does not wrap.

use std::fs::{FileType, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use styx::Qid;

/// Derive a qid from host metadata: the path is the inode number and the
/// version changes whenever the file is modified.
pub fn qid_from_meta(attr: &Metadata) -> Qid {
    Qid {
        typ: attr.file_type().into(),
        version: (attr.mtime() as u32) ^ ((attr.size() as u32) << 8),
        path: attr.ino(),
    }
}

/// `d_type` byte of a directory entry.
pub fn dirent_type(typ: &FileType) -> u8 {
    if typ.is_dir() {
        4 // DT_DIR
    } else if typ.is_symlink() {
        10 // DT_LNK
    } else if typ.is_fifo() {
        1 // DT_FIFO
    } else if typ.is_char_device() {
        2 // DT_CHR
    } else if typ.is_block_device() {
        6 // DT_BLK
    } else if typ.is_socket() {
        12 // DT_SOCK
    } else {
        8 // DT_REG
    }
}

/// Extended-attribute syscalls over `CString` paths. All of these follow
/// the usual probe-then-fetch size dance and retry when the attribute
/// grows in between.
pub mod xattrs {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use nix::errno::Errno;
    use nix::libc;
    use styx::Result;
    use styx::error::{Error, errno::*};

    fn cpath(path: &Path) -> Result<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::No(EINVAL))
    }

    fn cname(name: &str) -> Result<CString> {
        CString::new(name).map_err(|_| Error::No(EINVAL))
    }

    pub fn get(path: &Path, name: &str) -> Result<Vec<u8>> {
        let path = cpath(path)?;
        let name = cname(name)?;
        loop {
            let size = unsafe {
                libc::getxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
            };
            if size < 0 {
                return Err(Error::No(Errno::last()));
            }
            let mut buf = vec![0u8; size as usize];
            let got = unsafe {
                libc::getxattr(
                    path.as_ptr(),
                    name.as_ptr(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if got >= 0 {
                buf.truncate(got as usize);
                return Ok(buf);
            }
            if Errno::last() != Errno::ERANGE {
                return Err(Error::No(Errno::last()));
            }
        }
    }

    pub fn list(path: &Path) -> Result<Vec<u8>> {
        let path = cpath(path)?;
        loop {
            let size = unsafe { libc::listxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
            if size < 0 {
                return Err(Error::No(Errno::last()));
            }
            let mut buf = vec![0u8; size as usize];
            let got = unsafe { libc::listxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
            if got >= 0 {
                buf.truncate(got as usize);
                return Ok(buf);
            }
            if Errno::last() != Errno::ERANGE {
                return Err(Error::No(Errno::last()));
            }
        }
    }

    pub fn remove(path: &Path, name: &str) -> Result<()> {
        let path = cpath(path)?;
        let name = cname(name)?;
        let rc = unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) };
        if rc < 0 {
            Err(Error::No(Errno::last()))
        } else {
            Ok(())
        }
    }

    pub fn set(path: &Path, name: &str, value: &[u8], flags: u32) -> Result<()> {
        let path = cpath(path)?;
        let name = cname(name)?;
        let rc = unsafe {
            libc::setxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags as libc::c_int,
            )
        };
        if rc < 0 {
            Err(Error::No(Errno::last()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use styx::QidType;

    #[test]
    fn qid_tracks_inode_and_type() {
        let meta = std::fs::metadata("/").unwrap();
        let qid = qid_from_meta(&meta);
        assert!(qid.typ.contains(QidType::DIR));
        assert_eq!(qid.path, meta.ino());
    }

    #[test]
    fn qid_version_changes_with_size() {
        // version mixes mtime and size; same mtime, different size must
        // differ
        let a = (1000u32) ^ (100u32 << 8);
        let b = (1000u32) ^ (101u32 << 8);
        assert_ne!(a, b);
    }

    #[test]
    fn dirent_types_match_dt_constants() {
        let dir = std::fs::metadata("/").unwrap().file_type();
        assert_eq!(dirent_type(&dir), 4);
    }
}
