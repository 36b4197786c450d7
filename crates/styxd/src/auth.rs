//! Credential-blob authentication.
//!
//! The exchange: a client obtains an auth fid with `Tauth`, writes one
//! opaque credential blob into it, then attaches referencing the fid. The
//! attach succeeds only when the auth fid's uid, the uid the credential
//! decodes to, and the attach uid all agree; the uid is then recorded on
//! the connection so later afid-less attaches (v9fs `access=user`) by the
//! same or the root user pass.
//!
//! Credential issuance is someone else's job: [`CredDecoder`] only
//! validates a blob and yields the uid it vouches for. [`SecretDecoder`]
//! is the built-in shared-secret implementation; sites with a credential
//! daemon plug in their own decoder.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::warn;
use sha2::{Digest, Sha256};
use styx::Result;
use styx::auth::{AuthFid, AuthHandler};
use styx::error::{Error, errno::*};
use styx::srv::ConnInfo;
use styx::{NONUNAME, Qid, QidType};

use crate::config::Config;
use crate::usermap;

/// Validates an opaque credential blob, yielding the uid it certifies.
pub trait CredDecoder: Send + Sync + 'static {
    fn decode(&self, blob: &[u8]) -> Result<u32>;
}

/// Shared-secret credentials: `uid:expiry:hex(sha256(secret:uid:expiry))`.
///
/// `expiry` is seconds since the epoch; a blob is good until then.
pub struct SecretDecoder {
    secret: Vec<u8>,
}

impl SecretDecoder {
    pub fn new(secret: impl Into<Vec<u8>>) -> SecretDecoder {
        SecretDecoder {
            secret: secret.into(),
        }
    }

    pub fn from_file(path: &Path) -> io::Result<SecretDecoder> {
        let secret = std::fs::read(path)?;
        if secret.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "empty secret file",
            ));
        }
        Ok(SecretDecoder::new(secret))
    }

    fn digest(&self, uid: u32, expiry: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(format!(":{}:{}", uid, expiry));
        hex::encode(hasher.finalize())
    }

    /// Mint a credential. The server only verifies; this exists for the
    /// benefit of client tooling and tests.
    pub fn encode(&self, uid: u32, expiry: u64) -> String {
        format!("{}:{}:{}", uid, expiry, self.digest(uid, expiry))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl CredDecoder for SecretDecoder {
    fn decode(&self, blob: &[u8]) -> Result<u32> {
        let text = std::str::from_utf8(blob).map_err(|_| Error::No(EPERM))?;
        let mut parts = text.trim_end().splitn(3, ':');
        let (uid, expiry, mac) = match (parts.next(), parts.next(), parts.next()) {
            (Some(u), Some(e), Some(m)) => (u, e, m),
            _ => return Err(Error::No(EPERM)),
        };
        let uid: u32 = uid.parse().map_err(|_| Error::No(EPERM))?;
        let expiry: u64 = expiry.parse().map_err(|_| Error::No(EPERM))?;

        if expiry < unix_now() {
            return Err(Error::No(EPERM));
        }
        if self.digest(uid, expiry) != mac {
            return Err(Error::No(EPERM));
        }
        Ok(uid)
    }
}

/// The daemon's [`AuthHandler`]: enforces the uid agreement rules and the
/// per-export `noauth` escape hatch.
pub struct CredAuth<D: CredDecoder> {
    required: bool,
    no_auth_anames: HashSet<String>,
    decoder: Option<D>,
}

impl<D: CredDecoder> CredAuth<D> {
    pub fn new(config: &Config, decoder: Option<D>) -> CredAuth<D> {
        CredAuth {
            required: config.auth_required,
            no_auth_anames: config
                .exports
                .iter()
                .filter(|e| e.no_auth)
                .map(|e| e.aname.clone())
                .collect(),
            decoder,
        }
    }

    fn attach_uid(uname: &str, n_uname: u32) -> Result<u32> {
        if n_uname != NONUNAME {
            return Ok(n_uname);
        }
        // legacy attach without a numeric uid; resolve the name
        usermap::user_by_name(uname).map(|u| u.uid.as_raw())
    }
}

#[async_trait]
impl<D: CredDecoder> AuthHandler for CredAuth<D> {
    async fn start(&self, _afid: &AuthFid) -> Result<Option<Qid>> {
        if !self.required {
            return Ok(None);
        }
        Ok(Some(Qid {
            typ: QidType::AUTH,
            version: 0,
            path: 0,
        }))
    }

    async fn check(
        &self,
        conn: &ConnInfo,
        afid: Option<&AuthFid>,
        uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<()> {
        let uname = uname.to_owned();
        let n_uname_copy = n_uname;
        let uid = tokio::task::spawn_blocking(move || {
            Self::attach_uid(&uname, n_uname_copy)
        })
        .await??;

        let Some(afid) = afid else {
            // afid-less attach: fine when auth is off for this export, or
            // when a prior handshake on this connection covers the uid
            if !self.required || self.no_auth_anames.contains(aname) {
                return Ok(());
            }
            return match conn.authenticated_uid() {
                Some(auth_uid) if auth_uid == 0 || auth_uid == uid => Ok(()),
                _ => {
                    warn!("unauthenticated attach rejected: uid={}", uid);
                    Err(Error::No(EPERM))
                }
            };
        };

        let decoder = self.decoder.as_ref().ok_or(Error::No(EPERM))?;

        if afid.n_uname() != uid {
            warn!(
                "auth uid={} != attach uid={}",
                afid.n_uname(),
                uid
            );
            return Err(Error::No(EPERM));
        }
        let decoded = afid.with_cred(|cred| {
            let cred = cred.ok_or(Error::No(EPERM))?;
            decoder.decode(cred)
        })?;
        if decoded != uid {
            warn!("credential uid={} != attach uid={}", decoded, uid);
            return Err(Error::No(EPERM));
        }

        conn.set_authenticated_uid(decoded);
        afid.wipe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_future() -> u64 {
        unix_now() + 3600
    }

    #[test]
    fn secret_credentials_roundtrip() {
        let dec = SecretDecoder::new("cluster-secret");
        let blob = dec.encode(1000, far_future());
        assert_eq!(dec.decode(blob.as_bytes()).unwrap(), 1000);
    }

    #[test]
    fn tampered_credentials_are_rejected() {
        let dec = SecretDecoder::new("cluster-secret");
        let blob = dec.encode(1000, far_future());

        // claim a different uid with the old mac
        let forged = blob.replacen("1000", "0", 1);
        assert!(dec.decode(forged.as_bytes()).is_err());

        // a different secret signs nothing
        let other = SecretDecoder::new("other-secret");
        assert!(other.decode(blob.as_bytes()).is_err());
    }

    #[test]
    fn expired_and_malformed_credentials_are_rejected() {
        let dec = SecretDecoder::new("cluster-secret");
        let stale = dec.encode(1000, unix_now().saturating_sub(10));
        assert!(dec.decode(stale.as_bytes()).is_err());

        assert!(dec.decode(b"").is_err());
        assert!(dec.decode(b"not-a-cred").is_err());
        assert!(dec.decode(b"1000:999").is_err());
        assert!(dec.decode(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[tokio::test]
    async fn check_records_the_authenticated_uid() {
        let cfg = Config {
            listen: vec![],
            nwthread: 1,
            msize: 8192,
            auth_required: true,
            secret_file: None,
            exports: vec!["open=/srv/open,noauth".parse().unwrap()],
            squash_user: None,
            sync_dirs: false,
        };
        let dec = SecretDecoder::new("s3cret");
        let blob = dec.encode(1000, far_future());
        let auth = CredAuth::new(&cfg, Some(dec));

        let conn = ConnInfo::new(None, 8192);

        // unauthenticated attach to a guarded export fails
        assert!(auth.check(&conn, None, "alice", "home", 1000).await.is_err());
        // but the noauth export admits it
        auth.check(&conn, None, "alice", "open", 1000).await.unwrap();

        // complete a handshake
        let afid = AuthFid::new("alice", "home", 1000);
        afid.write_cred(0, blob.as_bytes()).unwrap();
        auth.check(&conn, Some(&afid), "alice", "home", 1000)
            .await
            .unwrap();
        assert_eq!(conn.authenticated_uid(), Some(1000));

        // the recorded uid now covers afid-less attaches for the same user
        auth.check(&conn, None, "alice", "home", 1000).await.unwrap();
        // and still refuses others
        assert!(auth.check(&conn, None, "bob", "home", 1001).await.is_err());
    }

    #[tokio::test]
    async fn check_demands_uid_agreement() {
        let cfg = Config {
            listen: vec![],
            nwthread: 1,
            msize: 8192,
            auth_required: true,
            secret_file: None,
            exports: vec![],
            squash_user: None,
            sync_dirs: false,
        };
        let dec = SecretDecoder::new("s3cret");
        let cred_for_1001 = dec.encode(1001, far_future());
        let auth = CredAuth::new(&cfg, Some(dec));
        let conn = ConnInfo::new(None, 8192);

        // credential decodes to 1001, attach claims 1000
        let afid = AuthFid::new("alice", "home", 1000);
        afid.write_cred(0, cred_for_1001.as_bytes()).unwrap();
        assert!(
            auth.check(&conn, Some(&afid), "alice", "home", 1000)
                .await
                .is_err()
        );
        assert_eq!(conn.authenticated_uid(), None);

        // afid claims 1001, attach claims 1000
        let afid = AuthFid::new("alice", "home", 1001);
        assert!(
            auth.check(&conn, Some(&afid), "alice", "home", 1000)
                .await
                .is_err()
        );
    }
}
