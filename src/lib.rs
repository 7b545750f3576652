//! Multiplexed SSH/SFTP client library.
//!
//! `sshmux` orchestrates many interactive SSH/SFTP sessions from one
//! process. A [`Mux`] resolves authentication material and bastion ("gate")
//! hosts per destination through priority-ordered match rules, caches one
//! live connection per address, hands out reference-counted handles to
//! concurrent consumers, and reaps idle connections in the background.
//! Each connection is an [`Agent`] that runs commands and moves files over
//! a uniform filesystem abstraction covering both the local host and the
//! remote SFTP side.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use sshmux::{Auth, Mux, MuxAuth};
//!
//! # async fn example() -> sshmux::Result<()> {
//! let mux = Mux::new(MuxAuth {
//!     auth_methods: HashMap::from([(
//!         "ops".to_string(),
//!         Auth::with_user("ops").private_key_file("/home/ops/.ssh/id_ed25519"),
//!     )]),
//!     default_auth: Some("ops".to_string()),
//!     agent_gates: HashMap::from([(
//!         "ipnet:10.1.0.0/16".to_string(),
//!         "bastion.example.com:22".to_string(),
//!     )]),
//!     ..Default::default()
//! })?;
//!
//! let agent = mux.dial("10.1.2.3:22").await?;
//! let _uptime = agent.rcmd("uptime", &[]).await?;
//! agent.put("./build/app", "/srv/app/app").await?;
//! agent.close().await;
//! mux.close().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod auth;
pub mod error;
pub mod fs;
pub mod matcher;
pub mod mux;
pub mod path;
pub mod session;
mod transport;

pub use agent::{Agent, CMD_SEPARATOR, COPY_BUFFER_SIZE};
pub use auth::{Auth, HostKeyCheck};
pub use error::{Error, Result};
pub use fs::{FileMeta, FileType, Fs, FsFile, LocalFs, OpenFlags, SftpFs, WdFs};
pub use matcher::{Matcher, MatcherBuilder, MatcherRegistry};
pub use mux::{Mux, MuxAuth, DEFAULT_KEEP_ALIVE_SECS};
pub use path::{LocalPath, PathEngine, VirtualPath};
pub use session::{SessionPool, SessionTicket};
pub use transport::TunnelStream;
