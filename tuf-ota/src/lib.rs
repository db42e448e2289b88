//! A rust implementation of [TUF](https://theupdateframework.github.io/specification/latest/)
//! metadata handling for over-the-air updates, using canonical JSON metadata.
//!
//! The crate has a repository side, which signs and publishes metadata
//! ([repository::Repository]), and a client side, which keeps a trusted copy of the metadata
//! up to date ([refresh::Refresher]) and checks downloaded target files against it.
//!
//! ## Example
//!
//! ```ignore
//! use tuf_ota::refresh::Refresher;
//! use tuf_ota::utils::{MemoryStorage, MemoryTransport};
//!
//! // initialize storage with a root that is trusted out of band
//! let storage = MemoryStorage::new(include_bytes!("path/to/1.root.json"))?;
//! let refresher = Refresher::new(storage, 32)?;
//!
//! let transport = MemoryTransport::from_repository_dir("path/to/repo".as_ref())?;
//! refresher.refresh(&transport, &chrono::Utc::now()).await?;
//!
//! // verify a target file using the refreshed metadata
//! let data = transport.fetch_target_bytes("hello-world.txt", 4096).await?;
//! refresher.trusted().verify_target("hello-world.txt", &data)?;
//! ```
//!
//! ## Storage
//!
//! If you need a implementor of the [TufStorage] trait you can use [utils::MemoryStorage] or
//! implement your own solution using the trait.
//!
//! ## TufTransport/Remote
//!
//! [utils::MemoryTransport] serves a repository from memory. HTTP and filesystem transports
//! live in the `tuf-ota-client` crate.

/// Module for builders to create TUF metadata.
pub mod builder;
/// Client side metadata refresh.
pub mod refresh;
/// Signing and publishing of repositories.
pub mod repository;
/// Implementation of TUF roles.
pub mod role;
/// Utility functions.
pub mod utils;
/// Signature threshold and expiry checks.
pub mod verifier;

/// Error types and more traits.
pub use tuf_ota_common as common;
/// The JSON metadata model.
pub use tuf_ota_json as json;
/// Re-export of errors.
pub use tuf_ota_common::error;
/// Fetching TUF files from remotes.
pub use tuf_ota_common::remote;
/// Storage of TUF files. Only has traits, there is an in-memory implementation available in [utils::MemoryStorage].
pub use tuf_ota_common::storage;
pub use tuf_ota_common::{remote::TufTransport, storage::TufStorage, TufError};
