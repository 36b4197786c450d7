//! User and group resolution.
//!
//! Thin wrappers over the re-entrant passwd/group lookups. Records are
//! created per attach, shared among cloned fids via `Arc`, and dropped
//! with the last fid; nothing is cached across requests. A failed lookup
//! reaches the client as permission denied.
//!
//! All functions here block on the name service and must be called from a
//! blocking context.

use std::ffi::CString;
use std::sync::Arc;

use nix::unistd::{self, Gid, Uid};
use styx::error::{Error, errno::*};
use styx::Result;

/// An attaching user: numeric ids, display name, and the supplementary
/// group set fetched once at attach time and re-applied on every identity
/// switch.
#[derive(Clone, Debug)]
pub struct UserRec {
    pub uid: Uid,
    pub gid: Gid,
    pub name: String,
    pub groups: Vec<Gid>,
}

impl UserRec {
    /// Whether `gid` is the user's primary or one of its supplementary
    /// groups. Root passes unconditionally.
    pub fn is_member(&self, gid: Gid) -> bool {
        self.uid.is_root() || self.gid == gid || self.groups.contains(&gid)
    }
}

/// A resolved group.
#[derive(Clone, Debug)]
pub struct GroupRec {
    pub gid: Gid,
    pub name: String,
}

fn build_user(user: unistd::User) -> Result<Arc<UserRec>> {
    let cname = CString::new(user.name.as_str()).map_err(|_| Error::No(EPERM))?;
    let groups = unistd::getgrouplist(&cname, user.gid).map_err(Error::from)?;
    Ok(Arc::new(UserRec {
        uid: user.uid,
        gid: user.gid,
        name: user.name,
        groups,
    }))
}

pub fn user_by_uid(uid: u32) -> Result<Arc<UserRec>> {
    unistd::User::from_uid(Uid::from_raw(uid))
        .map_err(Error::from)?
        .ok_or(Error::No(EPERM))
        .and_then(build_user)
}

pub fn user_by_name(name: &str) -> Result<Arc<UserRec>> {
    unistd::User::from_name(name)
        .map_err(Error::from)?
        .ok_or(Error::No(EPERM))
        .and_then(build_user)
}

pub fn group_by_gid(gid: u32) -> Result<GroupRec> {
    unistd::Group::from_gid(Gid::from_raw(gid))
        .map_err(Error::from)?
        .map(|g| GroupRec {
            gid: g.gid,
            name: g.name,
        })
        .ok_or(Error::No(EPERM))
}

pub fn group_by_name(name: &str) -> Result<GroupRec> {
    unistd::Group::from_name(name)
        .map_err(Error::from)?
        .map(|g| GroupRec {
            gid: g.gid,
            name: g.name,
        })
        .ok_or(Error::No(EPERM))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_both_ways() {
        let by_uid = user_by_uid(0).unwrap();
        assert_eq!(by_uid.uid, Uid::from_raw(0));
        assert!(!by_uid.name.is_empty());

        let by_name = user_by_name(&by_uid.name).unwrap();
        assert_eq!(by_name.uid, by_uid.uid);
        assert_eq!(by_name.gid, by_uid.gid);
    }

    #[test]
    fn unknown_users_and_groups_deny() {
        assert!(matches!(
            user_by_name("no-such-user-styxd"),
            Err(Error::No(EPERM))
        ));
        assert!(matches!(
            group_by_name("no-such-group-styxd"),
            Err(Error::No(EPERM))
        ));
    }

    #[test]
    fn group_zero_resolves_and_roundtrips() {
        let g = group_by_gid(0).unwrap();
        assert_eq!(g.gid, Gid::from_raw(0));
        let by_name = group_by_name(&g.name).unwrap();
        assert_eq!(by_name.gid, g.gid);
    }

    #[test]
    fn membership_includes_primary_and_supplementary() {
        let user = UserRec {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            name: "alice".into(),
            groups: vec![Gid::from_raw(44), Gid::from_raw(1000)],
        };
        assert!(user.is_member(Gid::from_raw(1000)));
        assert!(user.is_member(Gid::from_raw(44)));
        assert!(!user.is_member(Gid::from_raw(7)));

        let root = UserRec {
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            name: "root".into(),
            groups: Vec::new(),
        };
        assert!(root.is_member(Gid::from_raw(7)));
    }
}
