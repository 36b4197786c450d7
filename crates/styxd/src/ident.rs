//! Per-thread filesystem identity switching.
//!
//! Host access is checked as the attaching user by adopting its identity
//! around every path-sensitive syscall batch: supplementary groups first,
//! then fsgid, then fsuid. The switch is scoped to the calling thread, so
//! worker threads serving different users never see each other's
//! credentials. The guard restores the previous identity when dropped.
//!
//! `setfsuid(2)`/`setfsgid(2)` are thread-scoped by nature. `setgroups(2)`
//! is not: the libc wrapper broadcasts the change to every thread of the
//! process, so the raw syscall is used instead.

use log::error;
use nix::errno::Errno;
use nix::libc;
use nix::unistd::{self, Gid, Uid};
use styx::Result;
use styx::error::{Error, errno::*};

use crate::usermap::UserRec;

/// Thread-scoped setgroups. See the module comment for why libc's wrapper
/// won't do.
fn thread_setgroups(groups: &[Gid]) -> Result<()> {
    let raw: Vec<libc::gid_t> = groups.iter().map(|g| g.as_raw()).collect();
    let rc = unsafe { libc::syscall(libc::SYS_setgroups, raw.len(), raw.as_ptr()) };
    if rc < 0 {
        Err(Error::No(Errno::last()))
    } else {
        Ok(())
    }
}

fn thread_getgroups() -> Result<Vec<Gid>> {
    unistd::getgroups().map_err(Error::from)
}

/// Switches worker threads to the identity of the request's owning user.
pub struct Switcher {
    squash: bool,
}

impl Switcher {
    /// `squash` disables switching entirely; everything then runs as the
    /// server's own identity.
    pub fn new(squash: bool) -> Switcher {
        Switcher { squash }
    }

    pub fn is_squash(&self) -> bool {
        self.squash
    }

    /// Adopt `user` for the calling thread until the guard drops.
    pub fn assume(&self, user: &UserRec) -> Result<IdentityGuard> {
        if self.squash {
            return Ok(IdentityGuard { saved: None });
        }

        let saved_groups = thread_getgroups()?;
        thread_setgroups(&user.groups)?;

        let prev_gid = unistd::setfsgid(user.gid);
        // setfsgid cannot fail visibly; re-issuing it reports the value
        // actually in effect
        if unistd::setfsgid(user.gid) != user.gid {
            unistd::setfsgid(prev_gid);
            restore_groups(&saved_groups);
            return Err(Error::No(EPERM));
        }

        let prev_uid = unistd::setfsuid(user.uid);
        if unistd::setfsuid(user.uid) != user.uid {
            unistd::setfsuid(prev_uid);
            unistd::setfsgid(prev_gid);
            restore_groups(&saved_groups);
            return Err(Error::No(EPERM));
        }

        Ok(IdentityGuard {
            saved: Some(SavedIdent {
                fsuid: prev_uid,
                fsgid: prev_gid,
                groups: saved_groups,
            }),
        })
    }
}

struct SavedIdent {
    fsuid: Uid,
    fsgid: Gid,
    groups: Vec<Gid>,
}

fn restore_groups(groups: &[Gid]) {
    if let Err(e) = thread_setgroups(groups) {
        error!("failed to restore supplementary groups: {}", e);
    }
}

/// Restores the thread's previous identity on drop.
pub struct IdentityGuard {
    saved: Option<SavedIdent>,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            unistd::setfsuid(saved.fsuid);
            unistd::setfsgid(saved.fsgid);
            restore_groups(&saved.groups);
        }
    }
}

/// Permanently drop to `user`, real and effective ids both. Used at
/// startup when running with a squash user.
pub fn become_user(user: &UserRec) -> Result<()> {
    unistd::setgroups(&user.groups).map_err(Error::from)?;
    unistd::setresgid(user.gid, user.gid, user.gid).map_err(Error::from)?;
    unistd::setresuid(user.uid, user.uid, user.uid).map_err(Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_user(uid: u32) -> UserRec {
        UserRec {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(uid),
            name: format!("u{}", uid),
            groups: vec![Gid::from_raw(uid)],
        }
    }

    #[test]
    fn squash_mode_never_switches() {
        let switcher = Switcher::new(true);
        let before = unistd::setfsuid(Uid::from_raw(u32::MAX));
        {
            let _guard = switcher.assume(&fake_user(1234)).unwrap();
            assert_eq!(unistd::setfsuid(Uid::from_raw(u32::MAX)), before);
        }
        assert_eq!(unistd::setfsuid(Uid::from_raw(u32::MAX)), before);
    }

    #[test]
    fn assume_and_restore_as_root() {
        if !Uid::effective().is_root() {
            return;
        }

        let switcher = Switcher::new(false);
        let baseline = unistd::setfsuid(Uid::from_raw(u32::MAX));
        {
            let _guard = switcher.assume(&fake_user(12345)).unwrap();
            assert_eq!(
                unistd::setfsuid(Uid::from_raw(u32::MAX)),
                Uid::from_raw(12345)
            );
        }
        assert_eq!(unistd::setfsuid(Uid::from_raw(u32::MAX)), baseline);
    }
}
