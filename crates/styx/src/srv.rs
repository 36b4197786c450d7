//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000.L
//!
//! The engine owns everything between the byte stream and the
//! [`Filesystem`] implementation: framing, version negotiation, fid and tag
//! tables, the shared worker pool, flush sequencing, and the routing of
//! auth-fid traffic to the connection's [`AuthHandler`].

use {
    crate::{
        auth::{AuthFid, AuthHandler, AuthNone},
        error::{Error, errno::*},
        fcall::*,
        io_err, res, serialize,
        utils::{self, Result},
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{
        collections::VecDeque,
        net::SocketAddr,
        os::fd::AsFd,
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, TcpStream, UnixListener},
        sync::{Notify, mpsc},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

pub(crate) use crate::conn::{Conn, Request};
pub use crate::conn::ConnInfo;
pub use crate::fid::Fid;

/// Default msize ceiling offered to clients.
pub const DEFAULT_MSIZE: u32 = 128 * 1024;

/// Default number of worker tasks shared by all connections.
pub const DEFAULT_NWTHREAD: usize = 16;

// Keepalive is the only dead-peer detection there is; the protocol has no
// timeouts. 120s idle, 120s interval, 9 probes.
const KEEPALIVE_IDLE: u32 = 120;
const KEEPALIVE_INTERVAL: u32 = 120;
const KEEPALIVE_COUNT: u32 = 9;

/// Tunables of a [`Srv`].
#[derive(Copy, Clone, Debug)]
pub struct SrvConfig {
    /// Largest message size offered during version negotiation.
    pub msize: u32,
    /// Number of worker tasks draining the shared request queue.
    pub nwthread: usize,
}

impl Default for SrvConfig {
    fn default() -> Self {
        SrvConfig {
            msize: DEFAULT_MSIZE,
            nwthread: DEFAULT_NWTHREAD,
        }
    }
}

/// Filesystem server trait implementing 9P2000.L operation semantics.
///
/// Implementors represent an error condition by returning `Err`, which the
/// engine turns into the error response of the negotiated variant.
/// Every method has a default returning `EOPNOTSUPP`, so read-only or
/// partial filesystems implement only what they serve.
///
/// Version negotiation, flush, and the auth-fid exchange never reach this
/// trait; the engine handles them.
#[async_trait]
pub trait Filesystem: Send + Sync + 'static {
    /// Per-fid state, created via `Default` when the client introduces a
    /// new fid and dropped when the fid dies.
    type Fid: Send + Sync + Default + 'static;

    async fn rattach(
        &self,
        _fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Walk zero or more names from `fid`, binding the destination to
    /// `newfid`. Return the qids of the prefix that resolved; the engine
    /// registers `newfid` only when the whole sequence did. A walk that
    /// resolves nothing at all must fail with `ENOENT`.
    async fn rwalk(
        &self,
        _fid: &Fid<Self::Fid>,
        _newfid: &Fid<Self::Fid>,
        _wnames: &[String],
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rlopen(&self, _fid: &Fid<Self::Fid>, _flags: u32) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rlcreate(
        &self,
        _fid: &Fid<Self::Fid>,
        _name: &str,
        _flags: u32,
        _mode: u32,
        _gid: u32,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rread(&self, _fid: &Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rwrite(&self, _fid: &Fid<Self::Fid>, _offset: u64, _data: &Data) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    /// Read packed directory entries. An offset of zero rewinds; any other
    /// offset must equal the offset of the last entry previously returned.
    async fn rreaddir(&self, _fid: &Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rgetattr(&self, _fid: &Fid<Self::Fid>, _req_mask: GetattrMask) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rsetattr(
        &self,
        _fid: &Fid<Self::Fid>,
        _valid: SetattrMask,
        _stat: &SetAttr,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rstatfs(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rreadlink(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rsymlink(
        &self,
        _fid: &Fid<Self::Fid>,
        _name: &str,
        _symtgt: &str,
        _gid: u32,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rmknod(
        &self,
        _dfid: &Fid<Self::Fid>,
        _name: &str,
        _mode: u32,
        _major: u32,
        _minor: u32,
        _gid: u32,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rrename(
        &self,
        _fid: &Fid<Self::Fid>,
        _dfid: &Fid<Self::Fid>,
        _name: &str,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rrenameat(
        &self,
        _olddir: &Fid<Self::Fid>,
        _oldname: &str,
        _newdir: &Fid<Self::Fid>,
        _newname: &str,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rlink(
        &self,
        _dfid: &Fid<Self::Fid>,
        _fid: &Fid<Self::Fid>,
        _name: &str,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rmkdir(
        &self,
        _dfid: &Fid<Self::Fid>,
        _name: &str,
        _mode: u32,
        _gid: u32,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn runlinkat(&self, _dirfid: &Fid<Self::Fid>, _name: &str, _flags: u32) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rxattrwalk(
        &self,
        _fid: &Fid<Self::Fid>,
        _newfid: &Fid<Self::Fid>,
        _name: &str,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rxattrcreate(
        &self,
        _fid: &Fid<Self::Fid>,
        _name: &str,
        _attr_size: u64,
        _flags: u32,
    ) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rlock(&self, _fid: &Fid<Self::Fid>, _lock: &Flock) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rgetlock(&self, _fid: &Fid<Self::Fid>, _lock: &Getlock) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rfsync(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }

    async fn rclunk(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Ok(Fcall::Rclunk)
    }

    async fn rremove(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::No(EOPNOTSUPP))
    }
}

/// FIFO request queue shared by every connection of a server.
struct Queue<Fs: Filesystem> {
    requests: Mutex<VecDeque<Arc<Request<Fs>>>>,
    available: Notify,
}

impl<Fs: Filesystem> Queue<Fs> {
    fn new() -> Queue<Fs> {
        Queue {
            requests: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    fn push(&self, req: Arc<Request<Fs>>) {
        self.requests.lock().unwrap().push_back(req);
        self.available.notify_one();
    }

    async fn pop(&self) -> Arc<Request<Fs>> {
        loop {
            if let Some(req) = self.requests.lock().unwrap().pop_front() {
                return req;
            }
            self.available.notified().await;
        }
    }
}

struct SrvInner<Fs: Filesystem, A: AuthHandler> {
    fs: Fs,
    auth: A,
    msize: u32,
    queue: Queue<Fs>,
}

/// A 9P server: one filesystem, one auth handler, and a pool of workers
/// serving every connection handed to [`Srv::serve_stream`].
pub struct Srv<Fs: Filesystem, A: AuthHandler> {
    inner: Arc<SrvInner<Fs, A>>,
}

impl<Fs: Filesystem, A: AuthHandler> Clone for Srv<Fs, A> {
    fn clone(&self) -> Self {
        Srv {
            inner: self.inner.clone(),
        }
    }
}

impl<Fs: Filesystem, A: AuthHandler> Srv<Fs, A> {
    /// Create the server and spawn its worker pool on the current runtime.
    pub fn new(fs: Fs, auth: A, config: SrvConfig) -> Srv<Fs, A> {
        let inner = Arc::new(SrvInner {
            fs,
            auth,
            msize: config.msize.max(IOHDRSZ),
            queue: Queue::new(),
        });

        for _ in 0..config.nwthread.max(1) {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    let req = inner.queue.pop().await;
                    work_one(&inner, req).await;
                }
            });
        }

        Srv { inner }
    }

    /// Serve one established byte stream until EOF or a protocol error.
    pub async fn serve_stream<R, W>(
        &self,
        reader: R,
        writer: W,
        peer: Option<SocketAddr>,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let info = Arc::new(ConnInfo::new(peer, self.inner.msize));
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let conn = Conn::<Fs>::new(info.clone(), tx);

        let mut framedwrite = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(writer);
        let winfo = info.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let mut buf = bytes::BytesMut::new().writer();
                if let Err(e) = serialize::write_msg(&mut buf, &msg, winfo.protocol()) {
                    error!("failed to serialize response for tag {}: {}", msg.tag, e);
                    break;
                }
                debug!("→ {:?}", msg);
                if let Err(e) = framedwrite.send(buf.into_inner().freeze()).await {
                    debug!("writer finished: {}", e);
                    break;
                }
            }
        });

        let mut framedread = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .max_frame_length(self.inner.msize as usize)
            .new_read(reader);

        let res = self.read_loop(&conn, &mut framedread).await;
        conn.shutdown();
        res
    }

    async fn read_loop(
        &self,
        conn: &Arc<Conn<Fs>>,
        frames: &mut (impl tokio_stream::Stream<Item = std::io::Result<bytes::BytesMut>> + Unpin),
    ) -> Result<()> {
        while let Some(frame) = frames.next().await {
            let bytes = frame?;

            // the negotiated msize can be below the listener's ceiling
            if bytes.len() + 4 > conn.info.msize() as usize {
                return res!(io_err!(InvalidData, "oversize message"));
            }

            let msg = serialize::read_msg(&mut (&bytes[..]).reader(), conn.info.protocol())?;
            debug!("← {:?}", msg);

            match msg.body {
                Fcall::Tversion { msize, ref version } => {
                    if msg.tag != NOTAG {
                        return res!(io_err!(InvalidData, "Tversion with a real tag"));
                    }
                    let resp = conn.handle_version(self.inner.msize, msize, version);
                    conn.send(resp);
                }
                _ if !conn.is_versioned() => {
                    return res!(io_err!(InvalidData, "message before version negotiation"));
                }
                Fcall::Tflush { oldtag } => conn.start_flush(msg.tag, oldtag)?,
                body => {
                    let req = Request::new(msg.tag, body, conn);
                    conn.register(req.clone())?;
                    self.inner.queue.push(req);
                }
            }
        }

        Ok(())
    }

    /// Accept loop for one `proto!address...` listen string.
    pub async fn listen(&self, addr: &str) -> Result<()> {
        let (proto, listen_addr) = utils::parse_proto(addr)
            .ok_or_else(|| io_err!(InvalidInput, "invalid protocol or address"))?;

        match proto {
            "tcp" => self.listen_tcp(&listen_addr).await,
            "unix" => self.listen_unix(&listen_addr).await,
            _ => res!(io_err!(InvalidInput, "protocol not supported")),
        }
    }

    async fn listen_tcp(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            info!("accepted: {:?}", peer);
            if let Err(e) = set_keepalive(&stream) {
                error!("keepalive setup failed for {:?}: {}", peer, e);
            }

            let srv = self.clone();
            tokio::spawn(async move {
                let (readhalf, writehalf) = stream.into_split();
                if let Err(e) = srv.serve_stream(readhalf, writehalf, Some(peer)).await {
                    error!("connection {:?} failed: {}", peer, e);
                }
            });
        }
    }

    async fn listen_unix(&self, addr: &str) -> Result<()> {
        let listener = DeleteOnDrop::bind(addr)?;
        info!("listening on {}", addr);

        loop {
            let (stream, peer) = listener.accept().await?;
            info!("accepted: {:?}", peer);

            let srv = self.clone();
            tokio::spawn(async move {
                let (readhalf, writehalf) = tokio::io::split(stream);
                if let Err(e) = srv.serve_stream(readhalf, writehalf, None).await {
                    error!("connection failed: {}", e);
                }
            });
        }
    }
}

/// Dead-peer detection: the protocol has no timeouts, so rely on
/// aggressive TCP keepalives.
fn set_keepalive(stream: &TcpStream) -> nix::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    let fd = stream.as_fd();
    setsockopt(&fd, sockopt::KeepAlive, &true)?;
    setsockopt(&fd, sockopt::TcpKeepIdle, &KEEPALIVE_IDLE)?;
    setsockopt(&fd, sockopt::TcpKeepInterval, &KEEPALIVE_INTERVAL)?;
    setsockopt(&fd, sockopt::TcpKeepCount, &KEEPALIVE_COUNT)?;
    Ok(())
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// Serve a request to completion and settle its response.
async fn work_one<Fs: Filesystem, A: AuthHandler>(
    inner: &Arc<SrvInner<Fs, A>>,
    req: Arc<Request<Fs>>,
) {
    let Some(conn) = req.conn.upgrade() else {
        return;
    };
    if !req.begin() {
        // retracted by a flush while still queued
        return;
    }

    let rc = dispatch_once(inner, &conn, &req).await.unwrap_or_else(|e| {
        debug!("{:?} error: {}", MsgType::from(&req.body), e);
        e.to_rfcall(conn.info.protocol())
    });

    conn.respond(&req, rc);
}

async fn dispatch_once<Fs: Filesystem, A: AuthHandler>(
    inner: &Arc<SrvInner<Fs, A>>,
    conn: &Arc<Conn<Fs>>,
    req: &Request<Fs>,
) -> Result<Fcall> {
    use crate::fcall::Fcall::*;

    let fs = &inner.fs;
    let fids = &conn.fids;

    match &req.body {
        Tauth {
            afid,
            uname,
            aname,
            n_uname,
        } => {
            if fids.contains(*afid) {
                return Err(Error::No(EIO));
            }
            let fid = Arc::new(Fid::new_auth(
                *afid,
                Default::default(),
                conn.info.clone(),
                AuthFid::new(uname, aname, *n_uname),
            ));
            let Some(astate) = fid.auth() else {
                return Err(Error::No(EIO));
            };
            match inner.auth.start(astate).await? {
                Some(aqid) => {
                    fids.insert(fid.clone())?;
                    Ok(Rauth { aqid })
                }
                // reported as an error; clients attach unauthenticated
                None => Err(Error::No(EOPNOTSUPP)),
            }
        }

        Tattach {
            fid,
            afid,
            uname,
            aname,
            n_uname,
        } => {
            if fids.contains(*fid) {
                return Err(Error::No(EIO));
            }
            let afid_rec = if *afid == NOFID {
                None
            } else {
                Some(fids.lookup(*afid)?)
            };
            let astate = match &afid_rec {
                Some(rec) => Some(rec.auth().ok_or(Error::No(EIO))?),
                None => None,
            };

            inner
                .auth
                .check(&conn.info, astate, uname, aname, *n_uname)
                .await?;
            if let Some(astate) = astate {
                astate.set_verified();
            }

            let newfid = Arc::new(Fid::new(*fid, Default::default(), conn.info.clone()));
            let rc = fs
                .rattach(&newfid, afid_rec.as_deref(), uname, aname, *n_uname)
                .await?;
            if let Rattach { qid } = &rc {
                newfid.note_qid(qid);
            }
            fids.insert(newfid)?;
            Ok(rc)
        }

        Twalk {
            fid,
            newfid,
            wnames,
        } => {
            let fid_rec = fids.lookup(*fid)?;
            if fid_rec.is_auth() || fid_rec.is_opened() {
                return Err(Error::No(EIO));
            }
            if wnames.len() > MAXWELEM {
                return Err(Error::No(EIO));
            }

            let newfid_rec = if *newfid == fid_rec.fid() {
                fid_rec.clone()
            } else {
                if fids.contains(*newfid) {
                    return Err(Error::No(EIO));
                }
                Arc::new(Fid::new(*newfid, Default::default(), conn.info.clone()))
            };

            let rc = fs.rwalk(&fid_rec, &newfid_rec, wnames).await?;
            if let Rwalk { wqids } = &rc {
                // newfid comes to life only on full success
                if wqids.len() == wnames.len() {
                    match wqids.last() {
                        Some(qid) => newfid_rec.note_qid(qid),
                        None => newfid_rec.note_qid_type(fid_rec.qid_type()),
                    }
                    if !Arc::ptr_eq(&newfid_rec, &fid_rec) {
                        fids.insert(newfid_rec)?;
                    }
                }
            }
            Ok(rc)
        }

        Tlopen { fid, flags } => {
            let fid_rec = fids.lookup(*fid)?;
            if fid_rec.is_auth() || fid_rec.is_opened() {
                return Err(Error::No(EIO));
            }
            let rc = fs.rlopen(&fid_rec, *flags).await?;
            if let Rlopen { qid, .. } = &rc {
                fid_rec.note_qid(qid);
                fid_rec.set_opened();
            }
            Ok(rc)
        }

        Tlcreate {
            fid,
            name,
            flags,
            mode,
            gid,
        } => {
            let fid_rec = fids.lookup(*fid)?;
            if fid_rec.is_auth() || fid_rec.is_opened() {
                return Err(Error::No(EIO));
            }
            let rc = fs.rlcreate(&fid_rec, name, *flags, *mode, *gid).await?;
            if let Rlcreate { qid, .. } = &rc {
                fid_rec.note_qid(qid);
                fid_rec.set_opened();
            }
            Ok(rc)
        }

        Tread { fid, offset, count } => {
            let fid_rec = fids.lookup(*fid)?;
            if let Some(astate) = fid_rec.auth() {
                let data = inner.auth.read(astate, *offset, *count).await?;
                return Ok(Rread { data: Data(data) });
            }
            if fid_rec.is_dir() {
                return Err(Error::No(EISDIR));
            }
            let count = (*count).min(conn.info.iounit());
            fs.rread(&fid_rec, *offset, count).await
        }

        Twrite { fid, offset, data } => {
            let fid_rec = fids.lookup(*fid)?;
            if let Some(astate) = fid_rec.auth() {
                let count = inner.auth.write(astate, *offset, &data.0).await?;
                return Ok(Rwrite { count });
            }
            if fid_rec.is_dir() {
                return Err(Error::No(EISDIR));
            }
            fs.rwrite(&fid_rec, *offset, data).await
        }

        Treaddir { fid, offset, count } => {
            let fid_rec = fids.lookup(*fid)?;
            if !fid_rec.is_dir() {
                return Err(Error::No(ENOTDIR));
            }
            let count = (*count).min(conn.info.msize().saturating_sub(READDIRHDRSZ));
            fs.rreaddir(&fid_rec, *offset, count).await
        }

        Tgetattr { fid, req_mask } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rgetattr(&fid_rec, *req_mask).await
        }

        Tsetattr { fid, valid, stat } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rsetattr(&fid_rec, *valid, stat).await
        }

        Tstatfs { fid } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rstatfs(&fid_rec).await
        }

        Treadlink { fid } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rreadlink(&fid_rec).await
        }

        Tsymlink {
            fid,
            name,
            symtgt,
            gid,
        } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rsymlink(&fid_rec, name, symtgt, *gid).await
        }

        Tmknod {
            dfid,
            name,
            mode,
            major,
            minor,
            gid,
        } => {
            let dfid_rec = fids.lookup(*dfid)?;
            fs.rmknod(&dfid_rec, name, *mode, *major, *minor, *gid).await
        }

        Trename { fid, dfid, name } => {
            let fid_rec = fids.lookup(*fid)?;
            let dfid_rec = fids.lookup(*dfid)?;
            fs.rrename(&fid_rec, &dfid_rec, name).await
        }

        Trenameat {
            olddirfid,
            oldname,
            newdirfid,
            newname,
        } => {
            let old_rec = fids.lookup(*olddirfid)?;
            let new_rec = fids.lookup(*newdirfid)?;
            fs.rrenameat(&old_rec, oldname, &new_rec, newname).await
        }

        Tlink { dfid, fid, name } => {
            let dfid_rec = fids.lookup(*dfid)?;
            let fid_rec = fids.lookup(*fid)?;
            fs.rlink(&dfid_rec, &fid_rec, name).await
        }

        Tmkdir {
            dfid,
            name,
            mode,
            gid,
        } => {
            let dfid_rec = fids.lookup(*dfid)?;
            fs.rmkdir(&dfid_rec, name, *mode, *gid).await
        }

        Tunlinkat { dirfd, name, flags } => {
            let dir_rec = fids.lookup(*dirfd)?;
            fs.runlinkat(&dir_rec, name, *flags).await
        }

        Txattrwalk { fid, newfid, name } => {
            let fid_rec = fids.lookup(*fid)?;
            if fid_rec.is_auth() || *newfid == fid_rec.fid() || fids.contains(*newfid) {
                return Err(Error::No(EIO));
            }
            let newfid_rec = Arc::new(Fid::new(*newfid, Default::default(), conn.info.clone()));
            let rc = fs.rxattrwalk(&fid_rec, &newfid_rec, name).await?;
            newfid_rec.note_qid_type(QidType::FILE);
            fids.insert(newfid_rec)?;
            Ok(rc)
        }

        Txattrcreate {
            fid,
            name,
            attr_size,
            flags,
        } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rxattrcreate(&fid_rec, name, *attr_size, *flags).await
        }

        Tlock { fid, flock } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rlock(&fid_rec, flock).await
        }

        Tgetlock { fid, flock } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rgetlock(&fid_rec, flock).await
        }

        Tfsync { fid } => {
            let fid_rec = fids.lookup(*fid)?;
            fs.rfsync(&fid_rec).await
        }

        Tclunk { fid } => {
            // the fid dies no matter what the backend says
            let fid_rec = fids.remove(*fid).ok_or(Error::No(EBADF))?;
            if let Some(astate) = fid_rec.auth() {
                inner.auth.clunk(astate).await?;
                astate.wipe();
                return Ok(Rclunk);
            }
            fs.rclunk(&fid_rec).await
        }

        Tremove { fid } => {
            let fid_rec = fids.lookup(*fid)?;
            let rc = fs.rremove(&fid_rec).await;
            fids.remove(*fid);
            rc
        }

        _ => Err(Error::No(EOPNOTSUPP)),
    }
}

/// Serve `filesystem` on `addr` with defaults: no authentication, default
/// msize and worker count.
pub async fn srv_async<Fs: Filesystem>(filesystem: Fs, addr: &str) -> Result<()> {
    Srv::new(filesystem, AuthNone, SrvConfig::default())
        .listen(addr)
        .await
}
