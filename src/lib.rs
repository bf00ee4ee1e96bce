//! Keep an LDAP directory in line with the records of a research enclave.
//!
//! The enclave's relational store is the source of truth for users, projects,
//! roles and datasets. A [`SyncEngine`] reconciles the directory towards it:
//! every pass lists the managed containers, classifies each identifier as new,
//! changed, retired or unknown, and writes only the attribute values that
//! differ. Users additionally go through an account lifecycle: new accounts
//! are created and welcomed, inactive accounts are locked, and administrator
//! decisions are carried into the directory and the credential provider.
//!
//! Which directory attribute receives which domain field is configured with a
//! small mapping language, see [`mapping`]. Group membership is never stored
//! in the domain; it is evaluated from time-bounded grants at export time.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate which
//! is used here for interfacing with LDAP is an excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! A minimal run against a snapshot of the domain might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ldap_sync::{store::MemoryStore, Config, SyncEngine};
//!
//! let config = Config::from_file("config.yaml")?;
//! let store = MemoryStore::from_yaml(&std::fs::read_to_string("domain.yaml")?)?;
//!
//! let mut engine = SyncEngine::new(config, store)?;
//! // Import first so export sees locks the password policy placed.
//! let (import, export) = engine.run_sync().await?;
//! println!("{import}{export}");
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * Passes are not transactional. A failed operation leaves the identifier
//!   as it was and the next pass retries it.
//! * Passes must not overlap. Nothing here prevents two engines from working
//!   on the same directory at once.
//! * [secrecy](https://docs.rs/secrecy) is not used for storing the bind
//!   password, it probably should be

pub mod admin;
pub mod config;
pub mod credentials;
pub mod diff;
pub mod directory;
pub mod entry;
pub mod error;
pub mod lifecycle;
pub mod mapping;
pub mod model;
pub mod reconcile;
pub mod serialize;
pub mod store;

pub use ldap3;

pub use crate::{
	admin::AdminAction,
	config::{Config, ConnectionConfig, Container, Policy},
	directory::{Directory, LdapDirectory},
	entry::{DirectoryEntry, LockTime},
	error::Error,
	model::{Domain, User, UserStatus},
	reconcile::{EntityKind, PassReport, SyncEngine},
	store::{DomainStore, MemoryStore},
};
