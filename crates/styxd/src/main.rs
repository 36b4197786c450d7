//! styxd: export host directories over 9P2000.L.
//!
//! Clients are kernel v9fs mounts or library clients; access on the host
//! side is checked as the attaching user by per-thread identity switching,
//! which requires running as root. Without root (or with `--squash-user`)
//! everything is served under a single identity.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};
use nix::unistd::Uid;
use styx::srv::{DEFAULT_MSIZE, DEFAULT_NWTHREAD, Srv, SrvConfig};
use styx::{io_err, res};

mod auth;
mod backend;
mod config;
mod ctl;
mod ident;
mod lockmgr;
mod stats;
mod usermap;
mod utils;

use crate::auth::{CredAuth, SecretDecoder};
use crate::backend::Styxfs;
use crate::config::{Config, Export};
use crate::ident::Switcher;

#[derive(Debug, clap::Parser)]
#[command(name = "styxd", about = "Distributed file I/O daemon speaking 9P2000.L")]
struct Cli {
    /// Listen endpoint: tcp!address!port or unix!path (repeatable)
    #[arg(long = "listen", default_value = "tcp!0.0.0.0!564")]
    listen: Vec<String>,

    /// Export spec: ANAME=PATH[,ro][,noauth][,privport] (repeatable)
    #[arg(long = "export", required = true)]
    export: Vec<Export>,

    /// Worker tasks serving requests
    #[arg(long, default_value_t = DEFAULT_NWTHREAD)]
    nwthread: usize,

    /// Offered msize ceiling in bytes
    #[arg(long, default_value_t = DEFAULT_MSIZE)]
    msize: u32,

    /// Require a credential handshake before attach
    #[arg(long)]
    auth_required: bool,

    /// Shared-secret file backing the built-in credential decoder
    #[arg(long)]
    secret_file: Option<PathBuf>,

    /// Serve everything as this user instead of the attaching one
    #[arg(long)]
    squash_user: Option<String>,

    /// fsync the parent directory after create/rename/unlink
    #[arg(long)]
    sync_dirs: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            listen: self.listen,
            nwthread: self.nwthread,
            msize: self.msize,
            auth_required: self.auth_required,
            secret_file: self.secret_file,
            exports: self.export,
            squash_user: self.squash_user,
            sync_dirs: self.sync_dirs,
        }
    }
}

async fn styxd_main(config: Config) -> styx::Result<()> {
    let config = Arc::new(config);

    for export in &config.exports {
        if !std::fs::metadata(&export.root)
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return res!(io_err!(
                NotFound,
                format!("export {}: {:?} is not a directory", export.aname, export.root)
            ));
        }
    }

    let squash = match &config.squash_user {
        Some(name) => {
            let user = usermap::user_by_name(name)?;
            ident::become_user(&user)?;
            info!("running as squash user {} (uid {})", user.name, user.uid);
            true
        }
        None => {
            let root = Uid::effective().is_root();
            if !root {
                warn!("not running as root; serving with this process's identity");
            }
            !root
        }
    };
    let switcher = Arc::new(Switcher::new(squash));

    let decoder = match &config.secret_file {
        Some(path) => Some(SecretDecoder::from_file(path)?),
        None => None,
    };
    if config.auth_required && decoder.is_none() {
        return res!(io_err!(
            InvalidInput,
            "--auth-required needs --secret-file (or an external decoder)"
        ));
    }

    let fs = Styxfs::new(config.clone(), switcher);
    let auth = CredAuth::new(&config, decoder);
    let srv = Srv::new(
        fs,
        auth,
        SrvConfig {
            msize: config.msize,
            nwthread: config.nwthread,
        },
    );

    info!(
        "serving {} export(s) on {}",
        config.exports.len(),
        config.listen.join(", ")
    );
    futures::future::try_join_all(config.listen.iter().map(|addr| srv.listen(addr))).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = styxd_main(Cli::parse().into_config()).await {
        eprintln!("styxd: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use styx::auth::AuthNone;
    use styx::serialize;
    use styx::{
        Data, Fcall, GetattrMask, IOHDRSZ, Msg, NOFID, NOTAG, P92000L, Protocol, QidType,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct TestTree {
        root: PathBuf,
    }

    impl TestTree {
        fn new(tag: &str) -> TestTree {
            let root = std::env::temp_dir().join(format!("styxd-{}-{}", tag, std::process::id()));
            let _ = std::fs::remove_dir_all(&root);
            std::fs::create_dir_all(&root).unwrap();
            TestTree { root }
        }
    }

    impl Drop for TestTree {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn test_config(root: &std::path::Path, read_only: bool) -> Config {
        let opts = if read_only { ",ro" } else { "" };
        Config {
            listen: vec![],
            nwthread: 4,
            msize: 64 * 1024,
            auth_required: false,
            secret_file: None,
            exports: vec![
                format!("test={}{}", root.display(), opts).parse().unwrap(),
            ],
            squash_user: None,
            sync_dirs: false,
        }
    }

    fn spawn_daemon(config: Config) -> DuplexStream {
        let config = Arc::new(config);
        // tests run unprivileged; serve as ourselves
        let fs = Styxfs::new(config.clone(), Arc::new(Switcher::new(true)));
        let srv = Srv::new(
            fs,
            AuthNone,
            SrvConfig {
                msize: config.msize,
                nwthread: config.nwthread,
            },
        );
        let (client, server) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(server);
            let _ = srv.serve_stream(r, w, None).await;
        });
        client
    }

    async fn send(c: &mut DuplexStream, msg: &Msg) {
        let mut buf = Vec::new();
        serialize::write_msg(&mut buf, msg, Protocol::Linux).unwrap();
        c.write_u32_le(buf.len() as u32 + 4).await.unwrap();
        c.write_all(&buf).await.unwrap();
    }

    async fn call(c: &mut DuplexStream, tag: u16, body: Fcall) -> Fcall {
        send(c, &Msg { tag, body }).await;
        let size = c.read_u32_le().await.unwrap();
        let mut buf = vec![0u8; size as usize - 4];
        c.read_exact(&mut buf).await.unwrap();
        let msg =
            serialize::read_msg(&mut std::io::Cursor::new(buf), Protocol::Linux).unwrap();
        assert_eq!(msg.tag, tag);
        msg.body
    }

    async fn start_session(c: &mut DuplexStream, aname: &str) {
        let resp = call(
            c,
            NOTAG,
            Fcall::Tversion {
                msize: 64 * 1024,
                version: P92000L.to_owned(),
            },
        )
        .await;
        assert!(matches!(resp, Fcall::Rversion { .. }));

        let uid = Uid::current().as_raw();
        let resp = call(
            c,
            1,
            Fcall::Tattach {
                fid: 0,
                afid: NOFID,
                uname: "tester".to_owned(),
                aname: aname.to_owned(),
                n_uname: uid,
            },
        )
        .await;
        match resp {
            Fcall::Rattach { .. } => {}
            other => panic!("attach failed: {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_write_read_back_and_list() {
        let tree = TestTree::new("e2e");
        let mut c = spawn_daemon(test_config(&tree.root, false));
        start_session(&mut c, "test").await;

        // clone the root and create a file on the clone
        let resp = call(
            &mut c,
            2,
            Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: vec![],
            },
        )
        .await;
        assert!(matches!(resp, Fcall::Rwalk { .. }));

        let gid = nix::unistd::Gid::current().as_raw();
        let resp = call(
            &mut c,
            3,
            Fcall::Tlcreate {
                fid: 1,
                name: "hello.txt".to_owned(),
                flags: (nix::libc::O_WRONLY | nix::libc::O_TRUNC) as u32,
                mode: 0o644,
                gid,
            },
        )
        .await;
        match resp {
            Fcall::Rlcreate { qid, iounit } => {
                assert!(!qid.typ.contains(QidType::DIR));
                assert_eq!(iounit, 64 * 1024 - IOHDRSZ);
            }
            other => panic!("create failed: {:?}", other),
        }

        let resp = call(
            &mut c,
            4,
            Fcall::Twrite {
                fid: 1,
                offset: 0,
                data: Data(b"over the wire".to_vec()),
            },
        )
        .await;
        assert_eq!(resp, Fcall::Rwrite { count: 13 });
        assert_eq!(call(&mut c, 5, Fcall::Tclunk { fid: 1 }).await, Fcall::Rclunk);

        // walk to it again and read the content back
        let resp = call(
            &mut c,
            6,
            Fcall::Twalk {
                fid: 0,
                newfid: 2,
                wnames: vec!["hello.txt".to_owned()],
            },
        )
        .await;
        match resp {
            Fcall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
            other => panic!("walk failed: {:?}", other),
        }
        let resp = call(
            &mut c,
            7,
            Fcall::Tlopen {
                fid: 2,
                flags: nix::libc::O_RDONLY as u32,
            },
        )
        .await;
        assert!(matches!(resp, Fcall::Rlopen { .. }));
        let resp = call(
            &mut c,
            8,
            Fcall::Tread {
                fid: 2,
                offset: 0,
                count: 4096,
            },
        )
        .await;
        assert_eq!(
            resp,
            Fcall::Rread {
                data: Data(b"over the wire".to_vec())
            }
        );

        let resp = call(
            &mut c,
            9,
            Fcall::Tgetattr {
                fid: 2,
                req_mask: GetattrMask::BASIC,
            },
        )
        .await;
        match resp {
            Fcall::Rgetattr { stat, .. } => assert_eq!(stat.size, 13),
            other => panic!("getattr failed: {:?}", other),
        }

        // the directory listing includes ".", ".." and the new file
        let resp = call(
            &mut c,
            10,
            Fcall::Treaddir {
                fid: 0,
                offset: 0,
                count: 8192,
            },
        )
        .await;
        match resp {
            Fcall::Rreaddir { data } => {
                let names: Vec<_> = data.entries.iter().map(|e| e.name.as_str()).collect();
                assert!(names.contains(&"."));
                assert!(names.contains(&".."));
                assert!(names.contains(&"hello.txt"));
            }
            other => panic!("readdir failed: {:?}", other),
        }
    }

    #[tokio::test]
    async fn readdir_resumes_only_at_the_previous_cursor() {
        let tree = TestTree::new("readdir");
        for i in 0..10 {
            std::fs::write(tree.root.join(format!("f{:02}", i)), b"x").unwrap();
        }
        let mut c = spawn_daemon(test_config(&tree.root, false));
        start_session(&mut c, "test").await;

        // a small budget forces multiple rounds
        let mut names = Vec::new();
        let mut offset = 0;
        loop {
            let resp = call(
                &mut c,
                2,
                Fcall::Treaddir {
                    fid: 0,
                    offset,
                    count: 128,
                },
            )
            .await;
            let data = match resp {
                Fcall::Rreaddir { data } => data,
                other => panic!("readdir failed: {:?}", other),
            };
            if data.entries.is_empty() {
                break;
            }
            offset = data.last_offset().unwrap();
            names.extend(data.entries.into_iter().map(|e| e.name));
        }
        assert_eq!(names.len(), 12);
        for i in 0..10 {
            assert!(names.iter().any(|n| n == &format!("f{:02}", i)));
        }

        // a cold offset is refused
        let resp = call(
            &mut c,
            3,
            Fcall::Treaddir {
                fid: 0,
                offset: 999,
                count: 128,
            },
        )
        .await;
        assert!(matches!(resp, Fcall::Rlerror { .. }));

        // offset 0 rewinds
        let resp = call(
            &mut c,
            4,
            Fcall::Treaddir {
                fid: 0,
                offset: 0,
                count: 4096,
            },
        )
        .await;
        match resp {
            Fcall::Rreaddir { data } => assert_eq!(data.entries[0].name, "."),
            other => panic!("rewind failed: {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_only_exports_refuse_mutation() {
        let tree = TestTree::new("ro");
        std::fs::write(tree.root.join("present"), b"data").unwrap();
        let mut c = spawn_daemon(test_config(&tree.root, true));
        start_session(&mut c, "test").await;

        call(
            &mut c,
            2,
            Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: vec![],
            },
        )
        .await;
        let resp = call(
            &mut c,
            3,
            Fcall::Tlcreate {
                fid: 1,
                name: "nope".to_owned(),
                flags: nix::libc::O_WRONLY as u32,
                mode: 0o644,
                gid: nix::unistd::Gid::current().as_raw(),
            },
        )
        .await;
        assert_eq!(
            resp,
            Fcall::Rlerror {
                ecode: styx::errno::EROFS as u32
            }
        );

        let resp = call(
            &mut c,
            4,
            Fcall::Tmkdir {
                dfid: 0,
                name: "nope".to_owned(),
                mode: 0o755,
                gid: nix::unistd::Gid::current().as_raw(),
            },
        )
        .await;
        assert_eq!(
            resp,
            Fcall::Rlerror {
                ecode: styx::errno::EROFS as u32
            }
        );

        // reading still works
        call(
            &mut c,
            5,
            Fcall::Twalk {
                fid: 0,
                newfid: 2,
                wnames: vec!["present".to_owned()],
            },
        )
        .await;
        let resp = call(
            &mut c,
            6,
            Fcall::Tlopen {
                fid: 2,
                flags: nix::libc::O_RDONLY as u32,
            },
        )
        .await;
        assert!(matches!(resp, Fcall::Rlopen { .. }));
    }

    #[tokio::test]
    async fn ctl_namespace_serves_counters() {
        let tree = TestTree::new("ctl");
        let mut c = spawn_daemon(test_config(&tree.root, false));
        start_session(&mut c, "ctl").await;

        let resp = call(
            &mut c,
            2,
            Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["connections".to_owned()],
            },
        )
        .await;
        match resp {
            Fcall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
            other => panic!("ctl walk failed: {:?}", other),
        }

        let resp = call(
            &mut c,
            3,
            Fcall::Tlopen {
                fid: 1,
                flags: nix::libc::O_RDONLY as u32,
            },
        )
        .await;
        assert!(matches!(resp, Fcall::Rlopen { .. }));

        let resp = call(
            &mut c,
            4,
            Fcall::Tread {
                fid: 1,
                offset: 0,
                count: 4096,
            },
        )
        .await;
        match resp {
            Fcall::Rread { data } => {
                let text = String::from_utf8(data.0).unwrap();
                assert!(text.starts_with("attaches "), "unexpected: {}", text);
            }
            other => panic!("ctl read failed: {:?}", other),
        }

        // the control tree is read-only
        let resp = call(
            &mut c,
            5,
            Fcall::Twrite {
                fid: 1,
                offset: 0,
                data: Data(b"nope".to_vec()),
            },
        )
        .await;
        assert!(matches!(resp, Fcall::Rlerror { .. }));
    }

    #[tokio::test]
    async fn remove_unlinks_and_frees_the_fid() {
        let tree = TestTree::new("remove");
        std::fs::write(tree.root.join("doomed"), b"x").unwrap();
        let mut c = spawn_daemon(test_config(&tree.root, false));
        start_session(&mut c, "test").await;

        call(
            &mut c,
            2,
            Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["doomed".to_owned()],
            },
        )
        .await;
        assert_eq!(call(&mut c, 3, Fcall::Tremove { fid: 1 }).await, Fcall::Rremove);
        assert!(!tree.root.join("doomed").exists());

        // the fid is gone even though a second remove would fail
        let resp = call(&mut c, 4, Fcall::Tremove { fid: 1 }).await;
        assert_eq!(
            resp,
            Fcall::Rlerror {
                ecode: styx::errno::EBADF as u32
            }
        );

        // and the number is free for reuse
        let resp = call(
            &mut c,
            5,
            Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: vec![],
            },
        )
        .await;
        assert!(matches!(resp, Fcall::Rwalk { .. }));
    }
}
