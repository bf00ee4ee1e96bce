//! Account lifecycle.
//!
//! Export decides one [`Step`] per user and pass with [`plan`]. Administrator
//! decisions always take precedence over the automatic locks, so a pass never
//! re-locks a user an administrator just freed. Import observes locks the
//! password policy placed in the directory with [`observe_lock`].
//!
//! The audit log is the only time source for inactivity decisions. The lock
//! attribute's timestamp only matters for the wrong-password window.
use time::{Duration, OffsetDateTime};

use crate::{
	config::Policy,
	entry::LockTime,
	model::{AuditLog, User, UserStatus},
};

/// What export does with a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
	/// Leave the directory alone
	Skip,
	/// Create the entry, and the private group if enabled
	Create,
	/// Make sure the directory shows the account locked
	Lock {
		/// Status the user enters, if it changes
		enter: Option<UserStatus>,
		/// Disable the account at the credential provider
		disable: bool,
	},
	/// Remove the lock, enable the account and make the user Active
	Unlock,
	/// Patch attribute differences
	Patch,
}

/// Whether the user has gone without a successful login for longer than the
/// inactivity window. A window reaching past the calendar never elapses.
#[must_use]
pub fn is_inactive(user: &User, policy: &Policy, now: OffsetDateTime) -> bool {
	let Some(threshold) = now.checked_sub(policy.inactivity_window()) else {
		return false;
	};
	match user.ldap_last_auth_time {
		Some(last_auth) => last_auth < threshold,
		None => user.created_at < threshold,
	}
}

/// Whether an administrator unlocked the user after the last inactivity lock,
/// recently enough that the unlock still holds.
#[must_use]
pub fn admin_override(
	user: &User,
	history: &AuditLog,
	policy: &Policy,
	now: OffsetDateTime,
) -> bool {
	let Some(unlocked) = history.last_entered(user.id, UserStatus::UnlockedByAdmin) else {
		return false;
	};
	let newer = history
		.last_entered(user.id, UserStatus::LockedByInactivity)
		.map_or(true, |locked| unlocked > locked);
	newer && now - unlocked < policy.inactivity_window()
}

/// Decide what export does with a user. `in_directory` tells whether the
/// user's entry currently exists.
#[must_use]
pub fn plan(
	user: &User,
	in_directory: bool,
	history: &AuditLog,
	policy: &Policy,
	now: OffsetDateTime,
) -> Step {
	match user.status {
		UserStatus::PendingApproval => Step::Skip,
		UserStatus::New => Step::Create,
		status if !in_directory => {
			if status.is_membership_eligible() {
				Step::Create
			} else {
				Step::Skip
			}
		}
		UserStatus::LockedByAdmin | UserStatus::Disabled => {
			Step::Lock { enter: None, disable: true }
		}
		UserStatus::UnlockedByAdmin => Step::Unlock,
		UserStatus::Active | UserStatus::LockedByWrongPassword
			if is_inactive(user, policy, now) && !admin_override(user, history, policy, now) =>
		{
			Step::Lock { enter: Some(UserStatus::LockedByInactivity), disable: false }
		}
		UserStatus::LockedByInactivity => Step::Lock { enter: None, disable: false },
		UserStatus::Active | UserStatus::LockedByWrongPassword => Step::Patch,
	}
}

/// The result of observing the directory's lock attribute during import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockObservation {
	/// The value the domain lock field takes
	pub lock: Option<LockTime>,
	/// The status the user enters, if it changes
	pub enter: Option<UserStatus>,
}

/// Reconcile the domain's view of a lock with what the directory reports.
///
/// A timestamped lock on an Active user means the password policy locked it
/// after failed attempts. Such a lock clears once the lock window elapsed, as
/// does a lock the directory stopped reporting. Sentinel locks are placed by
/// export itself and leave the status alone.
#[must_use]
pub fn observe_lock(
	user: &User,
	observed: Option<LockTime>,
	policy: &Policy,
	now: OffsetDateTime,
) -> LockObservation {
	let clear = |status: UserStatus| LockObservation {
		lock: None,
		enter: (status == UserStatus::LockedByWrongPassword).then_some(UserStatus::Active),
	};
	match observed {
		None => clear(user.status),
		Some(LockTime::At(locked))
			if locked.checked_add(policy.lock_window()).is_some_and(|until| now > until) =>
		{
			clear(user.status)
		}
		Some(lock @ LockTime::At(_)) => LockObservation {
			lock: Some(lock),
			enter: (user.status == UserStatus::Active).then_some(UserStatus::LockedByWrongPassword),
		},
		Some(LockTime::Sentinel) => LockObservation { lock: Some(LockTime::Sentinel), enter: None },
	}
}

/// A user whose password expires soon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringPassword<'a> {
	/// The user
	pub user: &'a User,
	/// When the password expires
	pub expires_at: OffsetDateTime,
	/// Whole days left, negative once expired
	pub days_left: i64,
}

/// Users whose password expires within the warning window.
pub fn passwords_expiring<'a>(
	users: &'a [User],
	policy: &Policy,
	now: OffsetDateTime,
) -> Vec<ExpiringPassword<'a>> {
	let days = |days: u64| Duration::days(i64::try_from(days).unwrap_or(i64::MAX / 86_400));
	let max_age = days(policy.max_password_age_days);
	let Some(threshold) = now.checked_sub(max_age - days(policy.password_warning_days)) else {
		return Vec::new();
	};
	users
		.iter()
		.filter(|user| user.status.is_membership_eligible())
		.filter_map(|user| {
			let changed = user.ldap_last_pwd_change?;
			let expires_at = changed.checked_add(max_age)?;
			(changed <= threshold).then(|| ExpiringPassword {
				user,
				expires_at,
				days_left: (expires_at - now).whole_days(),
			})
		})
		.collect()
}
