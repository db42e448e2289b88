//! Update client on top of [tuf_ota]. It keeps the trusted metadata of one application in a
//! data directory, downloads new versions over HTTP(S) or from a local directory, verifies them
//! against the targets metadata and installs them with a backup to roll back to.
//!
//! ## Example
//!
//! ```ignore
//! use tuf_ota_client::{ClientConfig, UpdateController, UpdateOutcome};
//!
//! let config = ClientConfig::load("client.yaml".as_ref())?;
//! let controller = UpdateController::new(config)?;
//! match controller.start_update(None).await? {
//!     UpdateOutcome::Installed { version, .. } => println!("restart to use {version}"),
//!     UpdateOutcome::UpToDate { version } => println!("{version} is up to date"),
//! }
//! ```
//!
//! Only a single session runs per data directory, a second one fails with
//! [UpdateError::SessionAlreadyInProgress].

pub mod config;
pub mod controller;
pub mod download;
pub mod error;
pub mod events;
pub mod install;
/// Incremental updates with zstd dictionary patches.
pub mod patch;
pub mod session;
/// Filesystem backed [tuf_ota_common::storage::TufStorage].
pub mod storage;
pub mod transport;
pub mod watcher;

pub use config::ClientConfig;
pub use controller::{UpdateController, UpdateOutcome};
pub use error::UpdateError;
pub use events::UpdateEvent;
pub use install::{ArchiveInstaller, Installer};
pub use session::{SessionState, VersionInfo};
