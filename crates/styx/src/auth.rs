//! Authentication handshake support.
//!
//! A client opens an auxiliary fid with `Tauth`, writes an opaque
//! credential blob into it, then references it from `Tattach`. The engine
//! routes reads and writes on such fids to the connection's [`AuthHandler`]
//! instead of the filesystem, and consults the handler when an attach
//! arrives.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::conn::ConnInfo;
use crate::error::{Error, errno::*};
use crate::fcall::Qid;
use crate::utils::Result;

/// State of one authentication fid: the identity claimed at `Tauth` time
/// and the credential blob accumulated through writes.
#[derive(Debug)]
pub struct AuthFid {
    uname: String,
    aname: String,
    n_uname: u32,
    cred: Mutex<Option<Vec<u8>>>,
    verified: AtomicBool,
}

impl AuthFid {
    pub fn new(uname: &str, aname: &str, n_uname: u32) -> AuthFid {
        AuthFid {
            uname: uname.to_owned(),
            aname: aname.to_owned(),
            n_uname,
            cred: Mutex::new(None),
            verified: AtomicBool::new(false),
        }
    }

    pub fn uname(&self) -> &str {
        &self.uname
    }

    pub fn aname(&self) -> &str {
        &self.aname
    }

    pub fn n_uname(&self) -> u32 {
        self.n_uname
    }

    /// Store the credential blob. Only a single write at offset zero is
    /// accepted; the reference protocol does not define append semantics
    /// and we refuse them rather than silently accept both.
    pub fn write_cred(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let mut cred = self.cred.lock().unwrap();
        if offset != 0 || cred.is_some() {
            return Err(Error::No(EIO));
        }
        *cred = Some(data.to_vec());
        Ok(data.len() as u32)
    }

    /// Run `f` over the accumulated credential, if any.
    pub fn with_cred<R>(&self, f: impl FnOnce(Option<&[u8]>) -> R) -> R {
        let cred = self.cred.lock().unwrap();
        f(cred.as_deref())
    }

    pub fn set_verified(&self) {
        self.verified.store(true, Ordering::SeqCst);
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    /// Zero-clear and drop the credential buffer.
    pub fn wipe(&self) {
        if let Some(mut buf) = self.cred.lock().unwrap().take() {
            buf.iter_mut().for_each(|b| *b = 0);
        }
    }
}

impl Drop for AuthFid {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Hooks invoked by the engine around the auth-fid life cycle.
///
/// `check` is the gatekeeper for every attach, whether or not an auth fid
/// accompanies it.
#[async_trait]
pub trait AuthHandler: Send + Sync + 'static {
    /// Called on `Tauth`. Return `Some(aqid)` to begin an exchange on the
    /// afid or `None` when authentication is not required, which the
    /// engine reports as an error response the client treats as "proceed
    /// unauthenticated".
    async fn start(&self, afid: &AuthFid) -> Result<Option<Qid>>;

    /// Called on `Twrite` against an auth fid.
    async fn write(&self, afid: &AuthFid, offset: u64, data: &[u8]) -> Result<u32> {
        afid.write_cred(offset, data)
    }

    /// Called on `Tread` against an auth fid. The reference exchange is
    /// write-only.
    async fn read(&self, _afid: &AuthFid, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Called on `Tattach`, with the resolved auth fid when the client
    /// passed one. Failing here denies the attach with the returned errno.
    async fn check(
        &self,
        conn: &ConnInfo,
        afid: Option<&AuthFid>,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<()>;

    /// Called when an auth fid is clunked, before its credential buffer is
    /// wiped.
    async fn clunk(&self, _afid: &AuthFid) -> Result<()> {
        Ok(())
    }
}

/// Handler for servers that do not authenticate: every auth request is
/// declined and every attach admitted.
pub struct AuthNone;

#[async_trait]
impl AuthHandler for AuthNone {
    async fn start(&self, _afid: &AuthFid) -> Result<Option<Qid>> {
        Ok(None)
    }

    async fn check(
        &self,
        _conn: &ConnInfo,
        _afid: Option<&AuthFid>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<()> {
        Ok(())
    }
}
