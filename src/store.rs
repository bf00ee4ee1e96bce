//! The relational store holding the domain records.
//!
//! The engine loads one [`Domain`] snapshot per pass and writes back only user
//! records and status events, the only state a pass changes.
use async_trait::async_trait;

use crate::{
	error::Error,
	model::{Domain, StatusEvent, User},
};

/// Access to the domain records
#[async_trait]
pub trait DomainStore: Send {
	/// Load every record relevant to the directory.
	async fn load(&mut self) -> Result<Domain, Error>;
	/// Persist a changed user.
	async fn save_user(&mut self, user: &User) -> Result<(), Error>;
	/// Append a status change to the audit log.
	async fn append_event(&mut self, event: &StatusEvent) -> Result<(), Error>;
}

/// A store kept entirely in memory, e.g. for dry runs against a snapshot
/// read from a file.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	/// The records
	pub domain: Domain,
}

impl MemoryStore {
	/// Wrap a snapshot.
	#[must_use]
	pub fn new(domain: Domain) -> Self {
		Self { domain }
	}

	/// Read a snapshot serialized as YAML.
	pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
		Ok(Self::new(serde_yaml::from_str(yaml)?))
	}
}

#[async_trait]
impl DomainStore for MemoryStore {
	async fn load(&mut self) -> Result<Domain, Error> {
		Ok(self.domain.clone())
	}

	async fn save_user(&mut self, user: &User) -> Result<(), Error> {
		let stored = self
			.domain
			.users
			.iter_mut()
			.find(|stored| stored.id == user.id)
			.ok_or_else(|| Error::Missing(format!("user {}", user.username)))?;
		*stored = user.clone();
		Ok(())
	}

	async fn append_event(&mut self, event: &StatusEvent) -> Result<(), Error> {
		self.domain.history.append(event.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::{DomainStore, MemoryStore};
	use crate::model::{
		tests::{domain, NOW},
		StatusEvent, UserStatus,
	};

	#[tokio::test]
	async fn memory_store_round_trip() -> Result<(), Box<dyn std::error::Error>> {
		let mut store = MemoryStore::new(domain());
		let mut loaded = store.load().await?;
		loaded.users[0].status = UserStatus::Disabled;
		store.save_user(&loaded.users[0]).await?;
		store
			.append_event(&StatusEvent {
				user_id: 1,
				status: UserStatus::Disabled,
				at: NOW,
				reason: "test".to_owned(),
			})
			.await?;

		let reloaded = store.load().await?;
		assert_eq!(reloaded.users[0].status, UserStatus::Disabled);
		assert_eq!(reloaded.history.last_entered(1, UserStatus::Disabled), Some(NOW));

		let mut stranger = loaded.users[0].clone();
		stranger.id = 99;
		assert!(store.save_user(&stranger).await.is_err());
		Ok(())
	}

	#[test]
	fn snapshot_from_yaml() -> Result<(), Box<dyn std::error::Error>> {
		let yaml = serde_yaml::to_string(&domain())?;
		let store = MemoryStore::from_yaml(&yaml)?;
		assert_eq!(store.domain.users.len(), 5);
		Ok(())
	}
}
