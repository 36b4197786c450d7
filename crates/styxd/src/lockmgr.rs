//! Advisory lock arbitration.
//!
//! POSIX record locks are per-process, so taking them on the host would
//! collapse every client of this server into one lock owner. Locks are
//! arbitrated here instead, keyed by host (device, inode) and owned by the
//! (client_id, proc_id) pair from the wire. Nothing blocks server side: a
//! conflicting request answers BLOCKED and the client retries.
//!
//! Each fid gets a token at creation; dropping the fid releases whatever
//! that token still holds, mirroring lock-on-close semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use styx::{Flock, Getlock, LockStatus, LockType};

/// Host file identity locks are keyed by.
pub type FileKey = (u64, u64);

#[derive(Clone, Debug, PartialEq, Eq)]
struct Owner {
    client_id: String,
    proc_id: u32,
}

#[derive(Clone, Debug)]
struct LockEntry {
    write: bool,
    start: u64,
    /// Exclusive end; `u64::MAX` for a lock to EOF.
    end: u64,
    owner: Owner,
    token: u64,
}

impl LockEntry {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    fn conflicts(&self, other_owner: &Owner, write: bool, start: u64, end: u64) -> bool {
        self.owner != *other_owner && (self.write || write) && self.overlaps(start, end)
    }
}

fn range_of(start: u64, length: u64) -> (u64, u64) {
    if length == 0 {
        (start, u64::MAX)
    } else {
        (start, start.saturating_add(length))
    }
}

/// Server-wide lock table.
#[derive(Debug, Default)]
pub struct LockMgr {
    files: Mutex<HashMap<FileKey, Vec<LockEntry>>>,
    next_token: AtomicU64,
}

impl LockMgr {
    pub fn new() -> LockMgr {
        LockMgr::default()
    }

    /// Mint a per-fid token; locks registered under it die with the fid.
    pub fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Serve a `Tlock`.
    pub fn lock(&self, key: FileKey, flock: &Flock, token: u64) -> LockStatus {
        let owner = Owner {
            client_id: flock.client_id.clone(),
            proc_id: flock.proc_id,
        };
        let (start, end) = range_of(flock.start, flock.length);

        let mut files = self.files.lock().unwrap();
        let entries = files.entry(key).or_default();

        match flock.typ {
            LockType::Unlock => {
                Self::carve(entries, &owner, start, end);
                if entries.is_empty() {
                    files.remove(&key);
                }
                LockStatus::Success
            }
            typ => {
                let write = typ == LockType::WrLock;
                if entries.iter().any(|e| e.conflicts(&owner, write, start, end)) {
                    return LockStatus::Blocked;
                }
                // re-locking one's own range replaces it (up/downgrade)
                Self::carve(entries, &owner, start, end);
                entries.push(LockEntry {
                    write,
                    start,
                    end,
                    owner,
                    token,
                });
                LockStatus::Success
            }
        }
    }

    /// Serve a `Tgetlock`: report the first lock that would block the
    /// query, or echo it back with type UNLOCK when none would.
    pub fn getlock(&self, key: FileKey, query: &Getlock) -> Getlock {
        let owner = Owner {
            client_id: query.client_id.clone(),
            proc_id: query.proc_id,
        };
        let (start, end) = range_of(query.start, query.length);
        let write = query.typ == LockType::WrLock;

        let files = self.files.lock().unwrap();
        if let Some(conflict) = files
            .get(&key)
            .into_iter()
            .flatten()
            .find(|e| e.conflicts(&owner, write, start, end))
        {
            return Getlock {
                typ: if conflict.write {
                    LockType::WrLock
                } else {
                    LockType::RdLock
                },
                start: conflict.start,
                length: if conflict.end == u64::MAX {
                    0
                } else {
                    conflict.end - conflict.start
                },
                proc_id: conflict.owner.proc_id,
                client_id: conflict.owner.client_id.clone(),
            };
        }

        Getlock {
            typ: LockType::Unlock,
            start: query.start,
            length: query.length,
            proc_id: query.proc_id,
            client_id: query.client_id.clone(),
        }
    }

    /// Release everything a dead fid still holds.
    pub fn release_token(&self, token: u64) {
        let mut files = self.files.lock().unwrap();
        files.retain(|_, entries| {
            entries.retain(|e| e.token != token);
            !entries.is_empty()
        });
    }

    /// Remove the owner's coverage of `[start, end)`, splitting entries
    /// that straddle the boundary.
    fn carve(entries: &mut Vec<LockEntry>, owner: &Owner, start: u64, end: u64) {
        let mut split = Vec::new();
        entries.retain_mut(|e| {
            if e.owner != *owner || !e.overlaps(start, end) {
                return true;
            }
            if e.start < start {
                let mut left = e.clone();
                left.end = start;
                split.push(left);
            }
            if end < e.end {
                let mut right = e.clone();
                right.start = end;
                split.push(right);
            }
            false
        });
        entries.extend(split);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: FileKey = (1, 42);

    fn flock(typ: LockType, start: u64, length: u64, proc_id: u32, client: &str) -> Flock {
        Flock {
            typ,
            flags: 0,
            start,
            length,
            proc_id,
            client_id: client.to_owned(),
        }
    }

    fn getlock(typ: LockType, start: u64, length: u64, proc_id: u32, client: &str) -> Getlock {
        Getlock {
            typ,
            start,
            length,
            proc_id,
            client_id: client.to_owned(),
        }
    }

    #[test]
    fn writers_exclude_other_owners() {
        let mgr = LockMgr::new();
        let t1 = mgr.token();
        let t2 = mgr.token();

        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 0, 100, 1, "a"), t1),
            LockStatus::Success
        );
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 50, 10, 2, "b"), t2),
            LockStatus::Blocked
        );
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::RdLock, 0, 1, 2, "b"), t2),
            LockStatus::Blocked
        );
        // disjoint range is fine
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 100, 10, 2, "b"), t2),
            LockStatus::Success
        );
        // other files are unaffected
        assert_eq!(
            mgr.lock((1, 43), &flock(LockType::WrLock, 0, 100, 2, "b"), t2),
            LockStatus::Success
        );
    }

    #[test]
    fn readers_share_but_exclude_writers() {
        let mgr = LockMgr::new();
        let t1 = mgr.token();
        let t2 = mgr.token();

        assert_eq!(
            mgr.lock(KEY, &flock(LockType::RdLock, 0, 0, 1, "a"), t1),
            LockStatus::Success
        );
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::RdLock, 10, 10, 2, "b"), t2),
            LockStatus::Success
        );
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 5, 1, 2, "b"), t2),
            LockStatus::Blocked
        );
    }

    #[test]
    fn unlock_splits_straddling_ranges() {
        let mgr = LockMgr::new();
        let t1 = mgr.token();
        let t2 = mgr.token();

        mgr.lock(KEY, &flock(LockType::WrLock, 0, 100, 1, "a"), t1);
        mgr.lock(KEY, &flock(LockType::Unlock, 40, 20, 1, "a"), t1);

        // the carved-out middle is free for someone else
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 40, 20, 2, "b"), t2),
            LockStatus::Success
        );
        // the remnants still hold
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 0, 1, 2, "b"), t2),
            LockStatus::Blocked
        );
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 99, 1, 2, "b"), t2),
            LockStatus::Blocked
        );
    }

    #[test]
    fn same_owner_relocks_replace() {
        let mgr = LockMgr::new();
        let t1 = mgr.token();

        mgr.lock(KEY, &flock(LockType::WrLock, 0, 10, 1, "a"), t1);
        // downgrade in place; no self-conflict
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::RdLock, 0, 10, 1, "a"), t1),
            LockStatus::Success
        );

        let report = mgr.getlock(KEY, &getlock(LockType::WrLock, 0, 10, 2, "b"));
        assert_eq!(report.typ, LockType::RdLock);
    }

    #[test]
    fn getlock_reports_the_blocking_range() {
        let mgr = LockMgr::new();
        let t1 = mgr.token();
        mgr.lock(KEY, &flock(LockType::WrLock, 10, 0, 7, "a"), t1);

        let report = mgr.getlock(KEY, &getlock(LockType::RdLock, 0, 0, 9, "b"));
        assert_eq!(report.typ, LockType::WrLock);
        assert_eq!(report.start, 10);
        assert_eq!(report.length, 0);
        assert_eq!(report.proc_id, 7);
        assert_eq!(report.client_id, "a");

        // a non-conflicting probe echoes back unlocked
        let report = mgr.getlock(KEY, &getlock(LockType::RdLock, 0, 5, 9, "b"));
        assert_eq!(report.typ, LockType::Unlock);
        assert_eq!(report.start, 0);
        assert_eq!(report.length, 5);
    }

    #[test]
    fn dead_fids_release_their_locks() {
        let mgr = LockMgr::new();
        let t1 = mgr.token();
        let t2 = mgr.token();

        mgr.lock(KEY, &flock(LockType::WrLock, 0, 0, 1, "a"), t1);
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 0, 0, 2, "b"), t2),
            LockStatus::Blocked
        );

        mgr.release_token(t1);
        assert_eq!(
            mgr.lock(KEY, &flock(LockType::WrLock, 0, 0, 2, "b"), t2),
            LockStatus::Success
        );
    }
}
