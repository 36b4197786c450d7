//! Per-connection state: negotiated parameters, tag bookkeeping, response
//! sequencing and flush handling.
//!
//! A connection moves `fresh → versioned → serving ⇄ draining`. The reader
//! task (see `srv`) feeds decoded messages in; workers hand completed
//! responses back through [`Conn::respond`], which is the single place that
//! enforces the flush contract: a response is never transmitted after the
//! `Rflush` that retracted it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;
use tokio::sync::mpsc;

use crate::error::{Error, errno::*};
use crate::fcall::{Fcall, IOHDRSZ, Msg, NOTAG, Protocol, VERSION_UNKNOWN};
use crate::fid::FidTable;
use crate::srv::Filesystem;
use crate::utils::Result;

/// Connection-scoped facts a filesystem may consult through a fid: the
/// peer address, the negotiated message size and protocol variant, and the
/// uid a successful credential check recorded.
#[derive(Debug)]
pub struct ConnInfo {
    peer: Option<SocketAddr>,
    msize: AtomicU32,
    proto: Mutex<Protocol>,
    auth_uid: Mutex<Option<u32>>,
}

impl ConnInfo {
    pub fn new(peer: Option<SocketAddr>, msize: u32) -> ConnInfo {
        ConnInfo {
            peer,
            msize: AtomicU32::new(msize),
            proto: Mutex::new(Protocol::Linux),
            auth_uid: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::SeqCst)
    }

    /// I/O hint handed out by open/create responses.
    pub fn iounit(&self) -> u32 {
        self.msize().saturating_sub(IOHDRSZ)
    }

    pub fn protocol(&self) -> Protocol {
        *self.proto.lock().unwrap()
    }

    /// Uid recorded by a completed authentication handshake, if any.
    pub fn authenticated_uid(&self) -> Option<u32> {
        *self.auth_uid.lock().unwrap()
    }

    pub fn set_authenticated_uid(&self, uid: u32) {
        *self.auth_uid.lock().unwrap() = Some(uid);
    }

    fn renegotiate(&self, msize: u32, proto: Protocol) {
        self.msize.store(msize, Ordering::SeqCst);
        *self.proto.lock().unwrap() = proto;
        *self.auth_uid.lock().unwrap() = None;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    Done,
}

struct ReqState<Fs: Filesystem> {
    phase: Phase,
    cancelled: bool,
    /// Flush requests answered when this request finishes.
    waiters: Vec<Arc<Request<Fs>>>,
}

/// One outstanding request: the decoded body, its tag, and the state
/// machine that sequences its response against any flushes aimed at it.
///
/// Requests reference their connection weakly; the connection owns the
/// request through the tag table, never the other way around.
pub(crate) struct Request<Fs: Filesystem> {
    pub tag: u16,
    pub body: Fcall,
    pub conn: Weak<Conn<Fs>>,
    state: Mutex<ReqState<Fs>>,
}

impl<Fs: Filesystem> Request<Fs> {
    pub fn new(tag: u16, body: Fcall, conn: &Arc<Conn<Fs>>) -> Arc<Request<Fs>> {
        Arc::new(Request {
            tag,
            body,
            conn: Arc::downgrade(conn),
            state: Mutex::new(ReqState {
                phase: Phase::Queued,
                cancelled: false,
                waiters: Vec::new(),
            }),
        })
    }

    /// Transition `Queued → Running` when a worker picks the request up.
    /// Returns false when a flush already retracted it; the worker must
    /// then drop it without dispatching.
    pub fn begin(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.cancelled {
            st.phase = Phase::Done;
            false
        } else {
            st.phase = Phase::Running;
            true
        }
    }
}

/// One client connection: transport bookkeeping plus the fid and tag
/// tables scoped to it.
pub(crate) struct Conn<Fs: Filesystem> {
    pub info: Arc<ConnInfo>,
    pub fids: FidTable<Fs::Fid>,
    tags: Mutex<HashMap<u16, Arc<Request<Fs>>>>,
    outgoing: mpsc::UnboundedSender<Msg>,
    versioned: AtomicBool,
    draining: AtomicBool,
}

impl<Fs: Filesystem> Conn<Fs> {
    pub fn new(info: Arc<ConnInfo>, outgoing: mpsc::UnboundedSender<Msg>) -> Arc<Conn<Fs>> {
        Arc::new(Conn {
            info,
            fids: FidTable::new(),
            tags: Mutex::new(HashMap::new()),
            outgoing,
            versioned: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        })
    }

    pub fn is_versioned(&self) -> bool {
        self.versioned.load(Ordering::SeqCst)
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Queue a response frame for transmission. Silently dropped while
    /// draining; the peer is gone.
    pub fn send(&self, msg: Msg) {
        if !self.is_draining() {
            let _ = self.outgoing.send(msg);
        }
    }

    /// Track a new in-flight request. A tag already in use is a protocol
    /// violation and tears the connection down.
    pub fn register(&self, req: Arc<Request<Fs>>) -> Result<()> {
        let mut tags = self.tags.lock().unwrap();
        match tags.entry(req.tag) {
            std::collections::hash_map::Entry::Occupied(_) => Err(Error::No(EPROTO)),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(req);
                Ok(())
            }
        }
    }

    /// Process a `Tversion`. Any supported proposal resets the connection:
    /// outstanding requests are aborted, fids destroyed, and the effective
    /// msize/variant pinned until the next renegotiation.
    pub fn handle_version(&self, ceiling: u32, client_msize: u32, version: &str) -> Msg {
        let msize = client_msize.min(ceiling);

        let body = match Protocol::negotiate(version) {
            None => Fcall::Rversion {
                msize,
                version: VERSION_UNKNOWN.to_owned(),
            },
            Some(_) if msize < IOHDRSZ => Error::No(EIO).to_rfcall(self.info.protocol()),
            Some(proto) => {
                self.abort_outstanding();
                self.info.renegotiate(msize, proto);
                self.versioned.store(true, Ordering::SeqCst);
                Fcall::Rversion {
                    msize,
                    version: proto.as_str().to_owned(),
                }
            }
        };

        Msg { tag: NOTAG, body }
    }

    /// Handle a `Tflush` aimed at `oldtag`.
    ///
    /// A queued original is retracted on the spot: its response will never
    /// be generated and the flush is answered immediately. A running
    /// original keeps going; the flush is parked on it and answered after
    /// the original's response (if any) has been transmitted. An unknown
    /// or completed tag is acknowledged immediately.
    pub fn start_flush(self: &Arc<Self>, tag: u16, oldtag: u16) -> Result<()> {
        let target = self.tags.lock().unwrap().get(&oldtag).cloned();

        let Some(orig) = target else {
            self.send(Msg {
                tag,
                body: Fcall::Rflush,
            });
            return Ok(());
        };

        let mut st = orig.state.lock().unwrap();
        match st.phase {
            Phase::Queued => {
                st.cancelled = true;
                drop(st);
                self.tags.lock().unwrap().remove(&oldtag);
                self.send(Msg {
                    tag,
                    body: Fcall::Rflush,
                });
            }
            Phase::Running => {
                let freq = Request::new(tag, Fcall::Tflush { oldtag }, self);
                {
                    let mut fst = freq.state.lock().unwrap();
                    fst.phase = Phase::Running;
                }
                self.register(freq.clone())?;
                st.waiters.push(freq);
            }
            Phase::Done => {
                drop(st);
                self.send(Msg {
                    tag,
                    body: Fcall::Rflush,
                });
            }
        }
        Ok(())
    }

    /// Deliver a response and settle the request's flush waiters.
    ///
    /// The response is suppressed when the request was retracted or the
    /// connection is draining; either way every parked flush is answered
    /// afterwards and the tags are freed, original last.
    pub fn respond(&self, req: &Arc<Request<Fs>>, body: Fcall) {
        // the send happens under the state lock: a flush that finds this
        // request Done must enqueue its Rflush strictly after the response
        let waiters = {
            let mut st = req.state.lock().unwrap();
            if st.phase == Phase::Done {
                return;
            }
            st.phase = Phase::Done;
            if !st.cancelled {
                self.send(Msg { tag: req.tag, body });
            }
            std::mem::take(&mut st.waiters)
        };

        for waiter in waiters {
            self.respond(&waiter, Fcall::Rflush);
        }

        self.tags.lock().unwrap().remove(&req.tag);
    }

    /// Cancel every outstanding request and destroy every fid. Used by
    /// version renegotiation and teardown.
    fn abort_outstanding(&self) {
        let requests: Vec<_> = self.tags.lock().unwrap().drain().map(|(_, r)| r).collect();
        for req in requests {
            let mut st = req.state.lock().unwrap();
            if st.phase != Phase::Done {
                st.cancelled = true;
            }
            st.waiters.clear();
        }

        for fid in self.fids.drain() {
            if let Some(auth) = fid.auth() {
                auth.wipe();
            }
        }
    }

    /// Enter the draining state: no new requests, outstanding work
    /// completes with its output discarded, fids are destroyed.
    pub fn shutdown(&self) {
        debug!("connection draining: peer={:?}", self.info.peer());
        self.draining.store(true, Ordering::SeqCst);
        self.abort_outstanding();
    }
}
