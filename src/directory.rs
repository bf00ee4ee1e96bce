//! Directory client: the protocol operations a pass needs.
use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use ldap3::{
	adapters::{Adapter, EntriesOnly, PagedResults},
	LdapConnAsync, Mod, Scope, SearchEntry,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{config::Config, diff::Modification, entry::DirectoryEntry, error::Error};

/// A subtree search
#[derive(Debug, Clone, Copy)]
pub struct Search<'a> {
	/// Base DN
	pub base: &'a str,
	/// Filter
	pub filter: &'a str,
	/// Requested attributes
	pub attributes: &'a [&'a str],
	/// Page size of the simple paged results control, if used
	pub page_size: Option<i32>,
}

/// Operations on a bound directory connection
#[async_trait]
pub trait Directory: Send {
	/// Run a subtree search and collect the entries.
	async fn search(&mut self, search: Search<'_>) -> Result<Vec<DirectoryEntry>, Error>;
	/// Add an entry.
	async fn add(&mut self, entry: &DirectoryEntry) -> Result<(), Error>;
	/// Apply modifications to an entry in one request.
	async fn modify(&mut self, dn: &str, modifications: &[Modification]) -> Result<(), Error>;
	/// Delete an entry.
	async fn delete(&mut self, dn: &str) -> Result<(), Error>;
	/// Release the connection.
	async fn unbind(&mut self) -> Result<(), Error>;
}

/// A directory reached over LDAP
#[derive(Debug)]
pub struct LdapDirectory {
	/// Handle for issuing operations
	ldap: ldap3::Ldap,
	/// The task driving the connection
	conn: Option<JoinHandle<()>>,
	/// Timeout applied to every operation
	timeout: Duration,
}

impl LdapDirectory {
	/// Connect to the configured server and bind.
	pub async fn connect(config: &Config) -> Result<Self, Error> {
		let settings = config.connection.to_settings().await?;
		let (conn, mut ldap) = LdapConnAsync::from_url_with_settings(settings, &config.url).await?;
		let conn = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		});
		let timeout = config.connection.operation_timeout;

		ldap.with_timeout(timeout)
			.simple_bind(&config.bind_dn, &config.bind_password)
			.await?
			.success()?;
		debug!("Bound to {} as {}", config.url, config.bind_dn);
		Ok(Self { ldap, conn: Some(conn), timeout })
	}

	/// The handle, with the operation timeout armed for the next request.
	fn ldap(&mut self) -> &mut ldap3::Ldap {
		self.ldap.with_timeout(self.timeout)
	}
}

/// Turn a modification into the protocol's form.
fn to_mod(modification: &Modification) -> Mod<String> {
	match modification.clone() {
		Modification::Add(attribute, value) => Mod::Add(attribute, HashSet::from([value])),
		Modification::Delete(attribute, value) => Mod::Delete(attribute, HashSet::from([value])),
		Modification::Replace(attribute, value) => Mod::Replace(attribute, HashSet::from([value])),
	}
}

/// Turn an operation result into an error naming the entry.
fn rejected(operation: &'static str, dn: &str, result: ldap3::LdapResult) -> Result<(), Error> {
	match result.success() {
		Ok(_) => Ok(()),
		Err(ldap3::LdapError::LdapResult { result }) => Err(Error::Rejected {
			operation,
			dn: dn.to_owned(),
			message: format!("{} ({})", result.text, result.rc),
		}),
		Err(err) => Err(err.into()),
	}
}

#[async_trait]
impl Directory for LdapDirectory {
	async fn search(&mut self, search: Search<'_>) -> Result<Vec<DirectoryEntry>, Error> {
		let mut adapters: Vec<Box<dyn Adapter<_, _>>> = vec![Box::new(EntriesOnly::new())];
		if let Some(page_size) = search.page_size {
			adapters.push(Box::new(PagedResults::new(page_size)));
		}
		let mut stream = self
			.ldap()
			.streaming_search_with(
				adapters,
				search.base,
				Scope::Subtree,
				search.filter,
				search.attributes.to_vec(),
			)
			.await?;

		let mut entries = Vec::new();
		while let Some(entry) = stream.next().await?.map(SearchEntry::construct) {
			entries.push(DirectoryEntry::from(entry));
		}
		let result = stream.finish().await;
		// A missing search base means the container has no entries yet.
		if result.rc == 32 {
			debug!("Search base {} does not exist", search.base);
			return Ok(entries);
		}
		result.success()?;
		Ok(entries)
	}

	async fn add(&mut self, entry: &DirectoryEntry) -> Result<(), Error> {
		let attrs: Vec<(String, HashSet<String>)> = entry
			.attrs
			.iter()
			.map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
			.collect();
		let result = self.ldap().add(&entry.dn, attrs).await?;
		rejected("add", &entry.dn, result)
	}

	async fn modify(&mut self, dn: &str, modifications: &[Modification]) -> Result<(), Error> {
		if modifications.is_empty() {
			return Ok(());
		}
		let result = self.ldap().modify(dn, modifications.iter().map(to_mod).collect()).await?;
		rejected("modify", dn, result)
	}

	async fn delete(&mut self, dn: &str) -> Result<(), Error> {
		let result = self.ldap().delete(dn).await?;
		rejected("delete", dn, result)
	}

	async fn unbind(&mut self) -> Result<(), Error> {
		self.ldap().unbind().await?;
		if let Some(conn) = self.conn.take() {
			if let Err(err) = conn.await {
				warn!("Failed to join background task: {err}");
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use ldap3::Mod;

	use super::to_mod;
	use crate::diff::Modification;

	#[test]
	fn modifications_carry_one_value() {
		let add = to_mod(&Modification::Add("member".to_owned(), "uid=a".to_owned()));
		let member = HashSet::from(["uid=a".to_owned()]);
		assert!(matches!(add, Mod::Add(attr, values) if attr == "member" && values == member));
		let delete = to_mod(&Modification::Delete("memberUid".to_owned(), "a".to_owned()));
		assert!(matches!(delete, Mod::Delete(attr, _) if attr == "memberUid"));
		let replace = to_mod(&Modification::Replace("mail".to_owned(), "a@b".to_owned()));
		assert!(matches!(replace, Mod::Replace(attr, _) if attr == "mail"));
	}
}
