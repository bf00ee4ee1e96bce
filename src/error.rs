//! Error codes

use crate::{credentials::CredentialError, mapping::MappingError};

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// A required attribute in a search result was missing.
	#[error("Missing data: {0}")]
	Missing(String),
	/// The contents of an attribute did not confirm to the expected syntax.
	#[error("Malformed data: {0}")]
	Invalid(String),
	/// The configuration or the pre-provisioned domain data is unusable. Raised
	/// before any directory mutation happens.
	#[error("Invalid configuration: {0}")]
	Config(String),
	/// An underlying protocol error or similar occurred, or the LDAP library
	/// was used incorrectly.
	#[error(transparent)]
	Ldap(#[from] ldap3::LdapError),
	/// The directory refused an operation on an entry.
	#[error("Directory rejected {operation} on {dn}: {message}")]
	Rejected {
		/// Operation that was attempted
		operation: &'static str,
		/// Entry the operation targeted
		dn: String,
		/// Diagnostic message returned by the directory
		message: String,
	},
	/// Reading a file failed
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// The configuration file could not be parsed
	#[error(transparent)]
	Yaml(#[from] serde_yaml::Error),
	/// A domain object could not be mapped to a directory entry.
	#[error(transparent)]
	Mapping(#[from] MappingError),
	/// The credential provider failed.
	#[error(transparent)]
	Credential(#[from] CredentialError),
	/// The relational store failed to load or persist domain records.
	#[error("Domain store error: {0}")]
	Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}
