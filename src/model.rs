//! Domain records as held by the relational store.
//!
//! The engine works on a [`Domain`] snapshot loaded at the start of a pass.
//! Group membership is never stored directly; it is derived from time-bounded
//! membership records evaluated against "now", see [`Domain::project_members`],
//! [`Domain::role_members`] and [`Domain::dataset_members`].
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entry::LockTime;

/// Account status of a user. Accounts are never deleted, only disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UserStatus {
	/// Waiting for approval; never exported
	PendingApproval,
	/// Approved; the next pass creates the directory entry
	New,
	/// Able to log in
	Active,
	/// Locked by an administrator
	LockedByAdmin,
	/// Locked by the password policy after too many failed attempts
	LockedByWrongPassword,
	/// Locked after a long period without logins
	LockedByInactivity,
	/// Unlocked by an administrator; becomes Active on the next pass
	UnlockedByAdmin,
	/// Disabled instead of deleted
	Disabled,
}

impl UserStatus {
	/// Statuses whose users count as group members.
	pub const MEMBERSHIP_WHITELIST: [Self; 3] =
		[Self::Active, Self::LockedByWrongPassword, Self::UnlockedByAdmin];

	/// Whether users in this status count as group members
	#[must_use]
	pub fn is_membership_eligible(self) -> bool {
		Self::MEMBERSHIP_WHITELIST.contains(&self)
	}

	/// Whether an administrator can unlock users in this status
	#[must_use]
	pub fn is_locked(self) -> bool {
		matches!(
			self,
			Self::LockedByAdmin
				| Self::LockedByWrongPassword
				| Self::LockedByInactivity
				| Self::Disabled
		)
	}
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	/// Store id
	pub id: u64,
	/// Numeric POSIX id, used for both uid and gid
	pub ldap_id: Option<u32>,
	/// Login name; the directory identifier
	pub username: String,
	/// Given name
	pub first_name: String,
	/// Family name
	pub last_name: String,
	/// Mail address; also the key at the credential provider
	pub email: String,
	/// Account status
	pub status: UserStatus,
	/// System accounts get a separate password policy
	pub system_user: bool,
	/// Creation time of the record
	pub created_at: OffsetDateTime,
	/// Last successful authentication, as imported from the directory
	pub ldap_last_auth_time: Option<OffsetDateTime>,
	/// Lock the directory reports for the account, as imported
	pub ldap_lock_time: Option<LockTime>,
	/// Last password change, as imported from the directory
	pub ldap_last_pwd_change: Option<OffsetDateTime>,
}

impl User {
	/// Create a user in the New status.
	#[must_use]
	pub fn new(id: u64, username: &str, first_name: &str, last_name: &str, email: &str) -> Self {
		Self {
			id,
			ldap_id: None,
			username: username.to_owned(),
			first_name: first_name.to_owned(),
			last_name: last_name.to_owned(),
			email: email.to_owned(),
			status: UserStatus::New,
			system_user: false,
			created_at: OffsetDateTime::now_utc(),
			ldap_last_auth_time: None,
			ldap_lock_time: None,
			ldap_last_pwd_change: None,
		}
	}

	/// Given and family name
	#[must_use]
	pub fn full_name(&self) -> String {
		format!("{} {}", self.first_name, self.last_name)
	}
}

/// An institutional role such as "Researcher", mirrored as a directory group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
	/// Store id
	pub id: u64,
	/// Display name
	pub name: String,
	/// Group name in the directory
	pub ldap_name: String,
	/// Numeric POSIX group id
	pub ldap_id: Option<u32>,
	/// Free text
	pub description: Option<String>,
}

/// A user holding a role for a period of time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
	/// The user
	pub user_id: u64,
	/// The role
	pub role_id: u64,
	/// Start of the grant. Grants without a start are never in effect.
	pub begin: Option<OffsetDateTime>,
	/// End of the grant, open-ended if unset
	pub end: Option<OffsetDateTime>,
}

impl UserRole {
	/// Whether the grant is in effect at `now`
	#[must_use]
	pub fn is_active(&self, now: OffsetDateTime) -> bool {
		in_effect(self.begin, self.end, now)
	}
}

/// Project status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectStatus {
	/// Not yet approved; kept out of the directory
	PendingApproval,
	/// Exported as a group
	Active,
	/// Group removed from the directory
	Archived,
}

/// A research project, mirrored as a directory group of its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
	/// Store id
	pub id: u64,
	/// Display name
	pub name: String,
	/// Group name in the directory
	pub ldap_name: String,
	/// Numeric POSIX group id
	pub ldap_id: Option<u32>,
	/// Summary of the project
	pub abstract_text: String,
	/// Status
	pub status: ProjectStatus,
	/// Role whose members are instructors of the project
	pub instructors: Option<u64>,
	/// Creation time of the record
	pub created_at: OffsetDateTime,
}

/// Permission level a project role grants on project assets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SystemRole {
	/// Read only
	Reader,
	/// Read and write
	Writer,
	/// Manage the project
	Admin,
}

/// A role within projects, e.g. "Student (Reader)".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRole {
	/// Store id
	pub id: u64,
	/// Display name
	pub name: String,
	/// Granted permission level
	pub system_role: SystemRole,
}

/// A user's membership in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMember {
	/// The project
	pub project_id: u64,
	/// The member
	pub user_id: u64,
	/// The member's project role
	pub role_id: u64,
	/// Start of the membership. Memberships without a start are never in
	/// effect.
	pub start_date: Option<OffsetDateTime>,
	/// End of the membership, open-ended if unset
	pub end_date: Option<OffsetDateTime>,
}

impl ProjectMember {
	/// Whether the membership is in effect at `now`
	#[must_use]
	pub fn is_active(&self, now: OffsetDateTime) -> bool {
		in_effect(self.start_date, self.end_date, now)
	}
}

/// Dataset status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetStatus {
	/// Exported as a group
	Active,
	/// Group removed from the directory
	Disabled,
}

/// A dataset, mirrored as a directory group of the users allowed to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
	/// Store id
	pub id: u64,
	/// Public identifier of the dataset
	pub dataset_id: String,
	/// Display name
	pub name: String,
	/// Group name in the directory
	pub ldap_name: String,
	/// Numeric POSIX group id
	pub ldap_id: Option<u32>,
	/// Stored status
	pub status: DatasetStatus,
	/// Readable by every membership-eligible user
	pub public: bool,
	/// After this time the dataset counts as disabled
	pub expiration: Option<OffsetDateTime>,
}

impl Dataset {
	/// The status taking expiration into account
	#[must_use]
	pub fn effective_status(&self, now: OffsetDateTime) -> DatasetStatus {
		match self.expiration {
			Some(expiration) if now > expiration => DatasetStatus::Disabled,
			_ => self.status,
		}
	}
}

/// Access to a dataset granted to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetAccess {
	/// The project
	pub project_id: u64,
	/// The dataset
	pub dataset_id: u64,
	/// Start of the grant. Grants without a start are never in effect.
	pub granted_at: Option<OffsetDateTime>,
	/// End of the grant, open-ended if unset
	pub expire_at: Option<OffsetDateTime>,
}

impl DatasetAccess {
	/// Whether the grant is in effect at `now`
	#[must_use]
	pub fn is_active(&self, now: OffsetDateTime) -> bool {
		in_effect(self.granted_at, self.expire_at, now)
	}
}

/// `begin <= now < end`, with an unset begin never in effect and an unset end
/// open-ended.
fn in_effect(
	begin: Option<OffsetDateTime>,
	end: Option<OffsetDateTime>,
	now: OffsetDateTime,
) -> bool {
	begin.is_some_and(|begin| begin <= now) && end.map_or(true, |end| now < end)
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
	/// The user whose status changed
	pub user_id: u64,
	/// The status entered
	pub status: UserStatus,
	/// When the change happened
	pub at: OffsetDateTime,
	/// Why the change happened
	pub reason: String,
}

/// Append-only log of user status changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLog {
	/// Events in the order they were appended
	events: Vec<StatusEvent>,
}

impl AuditLog {
	/// Create a log from stored events.
	#[must_use]
	pub fn new(events: Vec<StatusEvent>) -> Self {
		Self { events }
	}

	/// Append an event.
	pub fn append(&mut self, event: StatusEvent) {
		self.events.push(event);
	}

	/// All events of a user, oldest first.
	pub fn events_for(&self, user_id: u64) -> impl Iterator<Item = &StatusEvent> {
		self.events.iter().filter(move |event| event.user_id == user_id)
	}

	/// The most recent time the user entered a status.
	#[must_use]
	pub fn last_entered(&self, user_id: u64, status: UserStatus) -> Option<OffsetDateTime> {
		self.events_for(user_id).filter(|event| event.status == status).map(|event| event.at).max()
	}
}

/// A member of a project together with the permission level they get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPermission {
	/// Login name of the member
	pub username: String,
	/// Permission level
	pub system_role: SystemRole,
}

/// Snapshot of all domain records relevant to the directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Domain {
	/// Users
	pub users: Vec<User>,
	/// Roles
	pub roles: Vec<Role>,
	/// Role grants
	pub user_roles: Vec<UserRole>,
	/// Projects
	pub projects: Vec<Project>,
	/// Project roles
	pub project_roles: Vec<ProjectRole>,
	/// Project memberships
	pub project_members: Vec<ProjectMember>,
	/// Datasets
	pub datasets: Vec<Dataset>,
	/// Dataset grants
	pub dataset_access: Vec<DatasetAccess>,
	/// Status history
	pub history: AuditLog,
}

impl Domain {
	/// Look up a user by store id
	#[must_use]
	pub fn user(&self, id: u64) -> Option<&User> {
		self.users.iter().find(|user| user.id == id)
	}

	/// Look up a user by login name
	#[must_use]
	pub fn user_by_name(&self, username: &str) -> Option<&User> {
		self.users.iter().find(|user| user.username == username)
	}

	/// Look up a project by store id
	#[must_use]
	pub fn project(&self, id: u64) -> Option<&Project> {
		self.projects.iter().find(|project| project.id == id)
	}

	/// Role grants in effect at `now` whose user is membership-eligible.
	pub fn active_role_grants(
		&self,
		role_id: u64,
		now: OffsetDateTime,
	) -> impl Iterator<Item = (&UserRole, &User)> {
		self.user_roles
			.iter()
			.filter(move |grant| grant.role_id == role_id && grant.is_active(now))
			.filter_map(move |grant| {
				self.user(grant.user_id)
					.filter(|user| user.status.is_membership_eligible())
					.map(|user| (grant, user))
			})
	}

	/// Membership-eligible users holding the role at `now`, ordered by name.
	#[must_use]
	pub fn role_members(&self, role_id: u64, now: OffsetDateTime) -> Vec<&User> {
		sorted_unique(self.active_role_grants(role_id, now).map(|(_, user)| user))
	}

	/// Membership-eligible users that are members of the project at `now`,
	/// including the holders of its instructor role, ordered by name.
	#[must_use]
	pub fn project_members(&self, project: &Project, now: OffsetDateTime) -> Vec<&User> {
		let members = self
			.project_members
			.iter()
			.filter(|member| member.project_id == project.id && member.is_active(now))
			.filter_map(|member| self.user(member.user_id))
			.filter(|user| user.status.is_membership_eligible());
		let instructors = project
			.instructors
			.into_iter()
			.flat_map(|role_id| self.active_role_grants(role_id, now).map(|(_, user)| user));
		sorted_unique(members.chain(instructors))
	}

	/// Active project members with the permission level each one gets.
	/// Instructors always get [`SystemRole::Writer`]; other members get the
	/// level of their project role.
	#[must_use]
	pub fn project_member_permissions(
		&self,
		project: &Project,
		now: OffsetDateTime,
	) -> Vec<MemberPermission> {
		let active: BTreeSet<&str> = self
			.project_members(project, now)
			.into_iter()
			.map(|user| user.username.as_str())
			.collect();

		let mut permissions: Vec<MemberPermission> = project
			.instructors
			.into_iter()
			.flat_map(|role_id| self.role_members(role_id, now))
			.map(|user| MemberPermission {
				username: user.username.clone(),
				system_role: SystemRole::Writer,
			})
			.collect();
		let instructors: BTreeSet<String> =
			permissions.iter().map(|permission| permission.username.clone()).collect();

		for member in self.project_members.iter().filter(|member| member.project_id == project.id) {
			let Some(user) = self.user(member.user_id) else { continue };
			if !active.contains(user.username.as_str()) || instructors.contains(&user.username) {
				continue;
			}
			let Some(role) = self.project_roles.iter().find(|role| role.id == member.role_id) else {
				continue;
			};
			permissions.push(MemberPermission {
				username: user.username.clone(),
				system_role: role.system_role,
			});
		}
		permissions
	}

	/// Users allowed to read the dataset at `now`, ordered by name. Public
	/// datasets are readable by every membership-eligible user, others by the
	/// members of active projects holding a grant in effect.
	#[must_use]
	pub fn dataset_members(&self, dataset: &Dataset, now: OffsetDateTime) -> Vec<&User> {
		if dataset.public {
			let eligible = self.users.iter().filter(|user| user.status.is_membership_eligible());
			return sorted_unique(eligible);
		}
		let projects = self
			.dataset_access
			.iter()
			.filter(|access| access.dataset_id == dataset.id && access.is_active(now))
			.filter_map(|access| self.project(access.project_id))
			.filter(|project| project.status == ProjectStatus::Active);
		sorted_unique(projects.flat_map(|project| self.project_members(project, now)))
	}
}

/// Deduplicate users by name and order them by name.
fn sorted_unique<'a>(users: impl Iterator<Item = &'a User>) -> Vec<&'a User> {
	let by_name: BTreeMap<&str, &User> = users.map(|user| (user.username.as_str(), user)).collect();
	by_name.into_values().collect()
}

#[cfg(test)]
pub(crate) mod tests {
	#![allow(clippy::unwrap_used)]

	use time::{macros::datetime, Duration, OffsetDateTime};

	use super::{
		AuditLog, Dataset, DatasetAccess, DatasetStatus, Domain, Project, ProjectMember,
		ProjectRole, ProjectStatus, Role, StatusEvent, SystemRole, User, UserRole, UserStatus,
	};

	pub(crate) const NOW: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

	pub(crate) fn user(id: u64, username: &str, status: UserStatus) -> User {
		let mut user = User::new(id, username, "First", "Last", &format!("{username}@example.org"));
		user.ldap_id = Some(1000 + u32::try_from(id).unwrap());
		user.status = status;
		user.created_at = NOW - Duration::days(10);
		user
	}

	/// Two active members, one with an expired membership, one locked out by
	/// an administrator, and an instructor role.
	pub(crate) fn domain() -> Domain {
		let since = Some(NOW - Duration::days(5));
		let member = |user_id, end_date| ProjectMember {
			project_id: 20,
			user_id,
			role_id: 30,
			start_date: since,
			end_date,
		};
		Domain {
			users: vec![
				user(1, "alice", UserStatus::Active),
				user(2, "bob", UserStatus::Active),
				user(3, "carol", UserStatus::Active),
				user(4, "dave", UserStatus::LockedByAdmin),
				user(5, "erin", UserStatus::LockedByWrongPassword),
			],
			roles: vec![Role {
				id: 10,
				name: "Instructors".to_owned(),
				ldap_name: "instructors".to_owned(),
				ldap_id: Some(5000),
				description: None,
			}],
			user_roles: vec![
				UserRole { user_id: 5, role_id: 10, begin: since, end: None },
				UserRole { user_id: 1, role_id: 10, begin: None, end: None },
			],
			projects: vec![Project {
				id: 20,
				name: "Food Analysis".to_owned(),
				ldap_name: "project-food".to_owned(),
				ldap_id: Some(7003),
				abstract_text: "Food".to_owned(),
				status: ProjectStatus::Active,
				instructors: Some(10),
				created_at: datetime!(2016-11-30 22:14:26 UTC),
			}],
			project_roles: vec![ProjectRole {
				id: 30,
				name: "Student".to_owned(),
				system_role: SystemRole::Reader,
			}],
			project_members: vec![
				member(1, None),
				member(2, Some(NOW + Duration::days(1))),
				member(3, Some(NOW - Duration::days(1))),
				member(4, None),
				member(5, None),
			],
			datasets: vec![Dataset {
				id: 40,
				dataset_id: "adrf-000001".to_owned(),
				name: "Wages".to_owned(),
				ldap_name: "adrf-000001".to_owned(),
				ldap_id: Some(9000),
				status: DatasetStatus::Active,
				public: false,
				expiration: None,
			}],
			dataset_access: vec![DatasetAccess {
				project_id: 20,
				dataset_id: 40,
				granted_at: since,
				expire_at: None,
			}],
			history: AuditLog::default(),
		}
	}

	fn names(users: Vec<&User>) -> Vec<&str> {
		users.into_iter().map(|user| user.username.as_str()).collect()
	}

	#[test]
	fn project_members_follow_time_and_status() {
		let domain = domain();
		let project = &domain.projects[0];
		assert_eq!(names(domain.project_members(project, NOW)), ["alice", "bob", "erin"]);
		assert_eq!(
			names(domain.project_members(project, NOW + Duration::days(2))),
			["alice", "erin"],
			"Bob's membership ends"
		);
	}

	#[test]
	fn role_grants_without_begin_never_apply() {
		let domain = domain();
		assert_eq!(names(domain.role_members(10, NOW)), ["erin"]);
	}

	#[test]
	fn member_permissions_prefer_instructor_role() {
		let domain = domain();
		let permissions = domain.project_member_permissions(&domain.projects[0], NOW);
		let summary: Vec<(&str, SystemRole)> = permissions
			.iter()
			.map(|permission| (permission.username.as_str(), permission.system_role))
			.collect();
		assert_eq!(
			summary,
			[
				("erin", SystemRole::Writer),
				("alice", SystemRole::Reader),
				("bob", SystemRole::Reader)
			]
		);
	}

	#[test]
	fn dataset_members() {
		let mut domain = domain();
		let members = domain.dataset_members(&domain.datasets[0], NOW);
		assert_eq!(names(members), ["alice", "bob", "erin"]);

		domain.projects[0].status = ProjectStatus::Archived;
		assert!(domain.dataset_members(&domain.datasets[0], NOW).is_empty());

		domain.datasets[0].public = true;
		assert_eq!(
			names(domain.dataset_members(&domain.datasets[0], NOW)),
			["alice", "bob", "carol", "erin"]
		);
	}

	#[test]
	fn expired_datasets_are_disabled() {
		let mut dataset = domain().datasets.remove(0);
		assert_eq!(dataset.effective_status(NOW), DatasetStatus::Active);
		dataset.expiration = Some(NOW - Duration::seconds(1));
		assert_eq!(dataset.effective_status(NOW), DatasetStatus::Disabled);
	}

	#[test]
	fn audit_log_last_entered() {
		let mut log = AuditLog::default();
		for days in [3, 1] {
			let status = UserStatus::LockedByInactivity;
			log.append(StatusEvent {
				user_id: 1,
				status,
				at: NOW - Duration::days(days),
				reason: String::new(),
			});
		}
		assert_eq!(
			log.last_entered(1, UserStatus::LockedByInactivity),
			Some(NOW - Duration::days(1))
		);
		assert_eq!(log.last_entered(1, UserStatus::UnlockedByAdmin), None);
		assert_eq!(log.last_entered(2, UserStatus::LockedByInactivity), None);
	}
}
