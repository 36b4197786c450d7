//! Per-connection fid bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::auth::AuthFid;
use crate::conn::ConnInfo;
use crate::error::{Error, errno::*};
use crate::fcall::{Qid, QidType};
use crate::utils::Result;

/// A client fid together with the filesystem's associated state.
///
/// The engine tracks the qid type and open state observed from responses so
/// it can police the fid state machine (no WALK on an opened fid, no byte
/// READ on a directory) without asking the backend.
#[derive(Debug)]
pub struct Fid<T> {
    fid: u32,

    /// `Filesystem::Fid` state associated with this fid.
    pub aux: T,

    qtype: AtomicU8,
    opened: AtomicBool,
    auth: Option<AuthFid>,
    conn: Arc<ConnInfo>,
}

impl<T> Fid<T> {
    pub(crate) fn new(fid: u32, aux: T, conn: Arc<ConnInfo>) -> Fid<T> {
        Fid {
            fid,
            aux,
            qtype: AtomicU8::new(0),
            opened: AtomicBool::new(false),
            auth: None,
            conn,
        }
    }

    pub(crate) fn new_auth(fid: u32, aux: T, conn: Arc<ConnInfo>, auth: AuthFid) -> Fid<T> {
        Fid {
            fid,
            aux,
            qtype: AtomicU8::new(QidType::AUTH.bits()),
            opened: AtomicBool::new(false),
            auth: Some(auth),
            conn,
        }
    }

    /// The raw client-side fid number.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The connection this fid belongs to.
    pub fn conn(&self) -> &ConnInfo {
        &self.conn
    }

    /// Qid type bits recorded from the response that bound this fid.
    pub fn qid_type(&self) -> QidType {
        QidType::from_bits_truncate(self.qtype.load(Ordering::SeqCst))
    }

    pub(crate) fn note_qid(&self, qid: &Qid) {
        self.qtype.store(qid.typ.bits(), Ordering::SeqCst);
    }

    pub(crate) fn note_qid_type(&self, typ: QidType) {
        self.qtype.store(typ.bits(), Ordering::SeqCst);
    }

    pub fn is_dir(&self) -> bool {
        self.qid_type().contains(QidType::DIR)
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn set_opened(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    /// Authentication state, present only on fids created by `Tauth`.
    pub fn auth(&self) -> Option<&AuthFid> {
        self.auth.as_ref()
    }

    pub fn is_auth(&self) -> bool {
        self.auth.is_some()
    }
}

/// The per-connection mapping from fid numbers to fid records.
///
/// All operations take the table mutex briefly; fids are handed out as
/// `Arc`s so backend calls never hold it.
#[derive(Debug)]
pub(crate) struct FidTable<T> {
    map: Mutex<HashMap<u32, Arc<Fid<T>>>>,
}

impl<T> FidTable<T> {
    pub fn new() -> FidTable<T> {
        FidTable {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Register a freshly created fid. Fails when the number is already
    /// bound, which the protocol forbids.
    pub fn insert(&self, fid: Arc<Fid<T>>) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        match map.entry(fid.fid) {
            std::collections::hash_map::Entry::Occupied(_) => Err(Error::No(EIO)),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(fid);
                Ok(())
            }
        }
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.map.lock().unwrap().contains_key(&fid)
    }

    pub fn lookup(&self, fid: u32) -> Result<Arc<Fid<T>>> {
        self.map
            .lock()
            .unwrap()
            .get(&fid)
            .cloned()
            .ok_or(Error::No(EBADF))
    }

    pub fn remove(&self, fid: u32) -> Option<Arc<Fid<T>>> {
        self.map.lock().unwrap().remove(&fid)
    }

    /// Drop every fid, returning the records so callers can finish
    /// auth-fid cleanup. Backend state is released as the last `Arc`s go.
    pub fn drain(&self) -> Vec<Arc<Fid<T>>> {
        self.map.lock().unwrap().drain().map(|(_, f)| f).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_info() -> Arc<ConnInfo> {
        Arc::new(ConnInfo::new(None, 8192))
    }

    #[test]
    fn insert_lookup_remove() {
        let table: FidTable<()> = FidTable::new();
        table
            .insert(Arc::new(Fid::new(0, (), conn_info())))
            .unwrap();

        assert_eq!(table.lookup(0).unwrap().fid(), 0);
        assert!(matches!(table.lookup(1), Err(Error::No(EBADF))));

        assert!(table.remove(0).is_some());
        assert!(table.remove(0).is_none());
        assert!(matches!(table.lookup(0), Err(Error::No(EBADF))));
    }

    #[test]
    fn duplicate_fid_numbers_are_refused_until_removed() {
        let table: FidTable<()> = FidTable::new();
        table
            .insert(Arc::new(Fid::new(7, (), conn_info())))
            .unwrap();
        assert!(
            table
                .insert(Arc::new(Fid::new(7, (), conn_info())))
                .is_err()
        );

        // the number is free for reuse once clunked
        table.remove(7);
        table
            .insert(Arc::new(Fid::new(7, (), conn_info())))
            .unwrap();
    }

    #[test]
    fn qid_notes_drive_the_state_machine() {
        let fid: Fid<()> = Fid::new(1, (), conn_info());
        assert!(!fid.is_dir());
        assert!(!fid.is_opened());

        fid.note_qid(&Qid {
            typ: QidType::DIR,
            version: 0,
            path: 9,
        });
        assert!(fid.is_dir());

        fid.set_opened();
        assert!(fid.is_opened());
    }
}
