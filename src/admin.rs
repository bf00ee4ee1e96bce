//! Administrative actions. They only record intent; the next export pass
//! carries status changes into the directory and the credential provider.
use time::OffsetDateTime;
use tracing::info;

use crate::{
	credentials::{CredentialCoordinator, CredentialFailure},
	error::Error,
	model::{StatusEvent, UserStatus},
	store::DomainStore,
};

/// An action an administrator takes on a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
	/// Lift any lock
	Unlock,
	/// Disable the account for good
	Disable,
	/// Lock the account
	Lock,
	/// Approve a pending account
	Activate,
	/// Send a new temporary password
	ResendWelcome,
}

impl AdminAction {
	/// The status a user in `current` status enters, or `None` for actions
	/// that leave the status alone.
	pub fn target(self, current: UserStatus) -> Result<Option<UserStatus>, Error> {
		Ok(match self {
			Self::Unlock if current.is_locked() => Some(UserStatus::UnlockedByAdmin),
			Self::Unlock => {
				return Err(Error::Invalid(format!(
					"Only locked accounts can be unlocked, not {current:?}"
				)));
			}
			Self::Disable => Some(UserStatus::Disabled),
			Self::Lock => Some(UserStatus::LockedByAdmin),
			Self::Activate if current == UserStatus::PendingApproval => Some(UserStatus::New),
			Self::Activate => {
				return Err(Error::Invalid(format!(
					"Only pending accounts can be activated, not {current:?}"
				)));
			}
			Self::ResendWelcome => None,
		})
	}
}

/// Apply an action to the named user. Returns the credential failures of a
/// resent welcome.
pub async fn apply<S: DomainStore>(
	store: &mut S,
	credentials: Option<&CredentialCoordinator>,
	username: &str,
	action: AdminAction,
	now: OffsetDateTime,
) -> Result<Vec<CredentialFailure>, Error> {
	let domain = store.load().await?;
	let mut user = domain
		.user_by_name(username)
		.cloned()
		.ok_or_else(|| Error::Missing(format!("user {username}")))?;

	let Some(status) = action.target(user.status)? else {
		let coordinator = credentials
			.ok_or_else(|| Error::Config("No credential provider is configured".to_owned()))?;
		info!("Resending welcome to {username}");
		return Ok(coordinator.welcome(&[&user]).await);
	};

	info!("{username}: {:?} -> {status:?} ({action:?})", user.status);
	user.status = status;
	store.save_user(&user).await?;
	store
		.append_event(&StatusEvent {
			user_id: user.id,
			status,
			at: now,
			reason: format!("admin: {action:?}"),
		})
		.await?;
	Ok(Vec::new())
}
