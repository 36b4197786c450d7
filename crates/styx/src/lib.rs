//! Asynchronous 9P2000.L file-service library.
//!
//! This crate implements the server side of the 9P2000.L protocol, the
//! Linux extension of the Plan 9 file protocol spoken by the kernel's v9fs
//! client. It provides the wire codec, the per-connection state machine
//! (fid and tag tables, version negotiation, flush sequencing), a shared
//! worker pool, and the traits a backend plugs into:
//!
//! - [`srv::Filesystem`] maps each 9P operation onto backing storage.
//! - [`auth::AuthHandler`] validates the credential blob a client writes
//!   into its auth fid before attaching.
//!
//! # Overview
//!
//! A connection is fed by one reader task and drained by one writer task;
//! requests are served by a fixed pool of workers shared across all
//! connections of a [`srv::Srv`]. Responses may complete in any order; the
//! request tag is the only correlation, and `Tflush` is the only
//! cancellation primitive.
//!
//! ```no_run
//! use styx::{srv::{Filesystem, srv_async}, Fcall, Result};
//! use async_trait::async_trait;
//!
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     type Fid = ();
//!
//!     async fn rattach(
//!         &self,
//!         _fid: &styx::srv::Fid<Self::Fid>,
//!         _afid: Option<&styx::srv::Fid<Self::Fid>>,
//!         _uname: &str,
//!         _aname: &str,
//!         _n_uname: u32,
//!     ) -> Result<Fcall> {
//!         Ok(Fcall::Rattach { qid: styx::Qid::default() })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(MyFs, "tcp!0.0.0.0!564").await
//! }
//! ```
//!
//! # Error handling
//!
//! Handlers return [`error::Error`]; the engine renders it as `Rlerror`
//! (or `Rerror` under the older variants) with the carried errno. Codec
//! failures never become error responses: a frame that cannot be trusted
//! tears the connection down.

pub mod auth;
mod conn;
pub mod error;
pub mod fcall;
mod fid;
pub mod serialize;
#[macro_use]
pub mod utils;
pub mod srv;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;

pub mod prelude {
    //! Names a filesystem implementation usually needs.
    pub use crate::auth::{AuthFid, AuthHandler, AuthNone};
    pub use crate::error::{Error, errno};
    pub use crate::fcall::*;
    pub use crate::srv::{ConnInfo, Fid, Filesystem, Srv, SrvConfig};
    pub use crate::utils::Result;
}
