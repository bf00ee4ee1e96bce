//! Reconciliation passes between the domain and the directory.
//!
//! An export pass converges the directory towards the domain, kind by kind:
//! users first (their status transitions decide group membership), then
//! projects, roles and datasets. Every identifier is handled independently, a
//! failed operation is recorded in the [`PassReport`] and the pass moves on.
//! An import pass pulls the few attributes the directory maintains itself back
//! into the user records.
use std::{
	collections::{BTreeMap, BTreeSet},
	fmt,
};

use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::{
	admin::{self, AdminAction},
	config::{Config, Container},
	credentials::{CredentialCoordinator, CredentialFailure},
	diff::attribute_diff,
	directory::{Directory, LdapDirectory, Search},
	entry::{DirectoryEntry, LockTime},
	error::Error,
	lifecycle::{self, Step},
	model::{DatasetStatus, Domain, ProjectStatus, StatusEvent, User, UserStatus},
	serialize::{group_name, KindMapping, MapContext, Serializers},
	store::DomainStore,
};

/// Attributes requested for user entries. The password policy attributes are
/// operational and only returned when asked for by name.
const USER_ATTRIBUTES: [&str; 5] =
	["*", "pwdAccountLockedTime", "pwdPolicySubentry", "authTimestamp", "pwdChangedTime"];

/// Attributes requested for group entries
const GROUP_ATTRIBUTES: [&str; 1] = ["*"];

/// The kinds of directory entries a pass maintains
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
	/// User accounts
	Users,
	/// Per-user private groups
	PrivateGroups,
	/// Project groups
	Projects,
	/// Role groups
	Roles,
	/// Dataset groups
	Datasets,
}

impl EntityKind {
	/// Every kind, in pass order
	pub const ALL: [Self; 5] =
		[Self::Users, Self::PrivateGroups, Self::Projects, Self::Roles, Self::Datasets];
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Users => "users",
			Self::PrivateGroups => "private groups",
			Self::Projects => "projects",
			Self::Roles => "roles",
			Self::Datasets => "datasets",
		})
	}
}

/// Counts for one kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindSummary {
	/// Entries added
	pub created: usize,
	/// Entries modified
	pub updated: usize,
	/// Entries deleted
	pub deleted: usize,
	/// Directory entries without a domain counterpart
	pub unmanaged: usize,
	/// Failed operations
	pub errors: usize,
}

/// A failed operation on one identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
	/// Kind of the entity
	pub kind: EntityKind,
	/// Identifier of the entity
	pub identifier: String,
	/// The operation that failed
	pub operation: &'static str,
	/// What went wrong
	pub message: String,
}

/// Outcome of a pass
#[derive(Debug, Default)]
pub struct PassReport {
	/// Counts per kind
	pub summaries: BTreeMap<EntityKind, KindSummary>,
	/// Every failed directory or store operation, for targeted re-runs
	pub failures: Vec<Failure>,
	/// Credential provider failures. They never fail the pass.
	pub credential_failures: Vec<CredentialFailure>,
}

impl PassReport {
	fn with_kinds(kinds: &[EntityKind]) -> Self {
		Self {
			summaries: kinds.iter().map(|kind| (*kind, KindSummary::default())).collect(),
			..Self::default()
		}
	}

	/// Counts for a kind
	#[must_use]
	pub fn summary(&self, kind: EntityKind) -> KindSummary {
		self.summaries.get(&kind).copied().unwrap_or_default()
	}

	fn summary_mut(&mut self, kind: EntityKind) -> &mut KindSummary {
		self.summaries.entry(kind).or_default()
	}

	fn fail(&mut self, kind: EntityKind, identifier: &str, operation: &'static str, err: &Error) {
		error!("{operation} of {kind} {identifier} failed: {err}");
		self.summary_mut(kind).errors += 1;
		self.failures.push(Failure {
			kind,
			identifier: identifier.to_owned(),
			operation,
			message: err.to_string(),
		});
	}

	/// Number of directory writes the pass made
	#[must_use]
	pub fn mutations(&self) -> usize {
		self.summaries
			.values()
			.map(|summary| summary.created + summary.updated + summary.deleted)
			.sum()
	}

	/// Whether nothing failed
	#[must_use]
	pub fn is_clean(&self) -> bool {
		self.failures.is_empty() && self.credential_failures.is_empty()
	}
}

impl fmt::Display for PassReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (kind, summary) in &self.summaries {
			writeln!(
				f,
				"{kind}: {} created, {} updated, {} deleted, {} unmanaged, {} errors",
				summary.created, summary.updated, summary.deleted, summary.unmanaged, summary.errors
			)?;
		}
		if !self.failures.is_empty() {
			writeln!(f, "Failures:")?;
			for failure in &self.failures {
				writeln!(
					f,
					"  {} {}: {} failed: {}",
					failure.kind, failure.identifier, failure.operation, failure.message
				)?;
			}
		}
		if !self.credential_failures.is_empty() {
			writeln!(f, "Credential failures:")?;
			for failure in &self.credential_failures {
				writeln!(f, "  {}: {}", failure.username, failure.error)?;
			}
		}
		Ok(())
	}
}

/// Classification of the identifiers of one kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSet {
	/// Active in the domain, missing in the directory
	pub to_create: BTreeSet<String>,
	/// Active in the domain and present in the directory
	pub to_update: BTreeSet<String>,
	/// Disabled in the domain and still present in the directory
	pub to_delete: BTreeSet<String>,
	/// Present in the directory, unknown to the domain
	pub unmanaged: BTreeSet<String>,
}

impl SyncSet {
	/// Classify identifiers. An identifier both active and disabled counts as
	/// active.
	#[must_use]
	pub fn classify(
		active: &BTreeSet<String>,
		disabled: &BTreeSet<String>,
		directory: &BTreeSet<String>,
	) -> Self {
		let managed: BTreeSet<String> = active.union(disabled).cloned().collect();
		Self {
			to_create: active.difference(directory).cloned().collect(),
			to_update: active.intersection(directory).cloned().collect(),
			to_delete: disabled
				.difference(active)
				.filter(|id| directory.contains(*id))
				.cloned()
				.collect(),
			unmanaged: directory.difference(&managed).cloned().collect(),
		}
	}
}

/// An operation that failed on one identifier
#[derive(Debug)]
struct Failed {
	/// The operation
	operation: &'static str,
	/// What went wrong
	error: Error,
}

/// Tag an error with the operation it happened in.
fn at(operation: &'static str) -> impl FnOnce(Error) -> Failed {
	move |error| Failed { operation, error }
}

/// Key directory entries by the value of their naming attribute.
fn keyed(
	entries: Vec<DirectoryEntry>,
	rdn_attribute: &str,
	normalize: impl Fn(&str) -> String,
) -> BTreeMap<String, DirectoryEntry> {
	entries
		.into_iter()
		.filter_map(|entry| {
			let Some(id) = entry.attr_first(rdn_attribute).map(&normalize) else {
				debug!("Ignoring {}, it has no {rdn_attribute}", entry.dn);
				return None;
			};
			Some((id, entry))
		})
		.collect()
}

/// Read a wire timestamp, clearing values that do not parse.
fn imported_time(entry: &DirectoryEntry, attribute: &str) -> Option<OffsetDateTime> {
	match entry.time_first(attribute)? {
		Ok(time) => Some(time),
		Err(err) => {
			warn!("Ignoring {attribute} of {}: {err}", entry.dn);
			None
		}
	}
}

/// Delete an entry, recording the outcome.
async fn delete_entry(
	dir: &mut dyn Directory,
	kind: EntityKind,
	id: &str,
	dn: &str,
	report: &mut PassReport,
) {
	match dir.delete(dn).await {
		Ok(()) => {
			debug!("Deleted {kind} {id}");
			report.summary_mut(kind).deleted += 1;
		}
		Err(err) => report.fail(kind, id, "delete", &err),
	}
}

/// Release the connection on every exit path of a pass.
async fn release<T>(dir: &mut dyn Directory, result: Result<T, Error>) -> Result<T, Error> {
	if let Err(err) = dir.unbind().await {
		warn!("Unbinding from the directory failed: {err}");
	}
	result
}

/// Everything needed to export one group kind
struct GroupExport<'a> {
	/// Kind of the groups
	kind: EntityKind,
	/// Where the groups live
	container: &'a Container,
	/// Their mapping
	mapping: &'a KindMapping,
	/// Wanted entries of the active groups
	active: BTreeMap<String, Result<DirectoryEntry, Error>>,
	/// Identifiers of disabled groups
	disabled: BTreeSet<String>,
	/// Identifiers in the container that belong to another kind
	reserved: BTreeSet<String>,
}

/// Drives reconciliation passes.
#[derive(Debug)]
pub struct SyncEngine<S> {
	/// Immutable configuration
	config: Config,
	/// Compiled mappings
	serializers: Serializers,
	/// The domain records
	store: S,
	/// Credential side effects, if a provider is configured
	credentials: Option<CredentialCoordinator>,
}

impl<S: DomainStore> SyncEngine<S> {
	/// Create an engine. Fails on configuration no pass could run with,
	/// before anything is written anywhere.
	pub fn new(config: Config, store: S) -> Result<Self, Error> {
		config.validate()?;
		let serializers = Serializers::new(&config)?;
		let credentials =
			config.credentials.as_ref().map(CredentialCoordinator::from_config).transpose()?;
		Ok(Self { config, serializers, store, credentials })
	}

	/// Use the given coordinator for credential side effects.
	#[must_use]
	pub fn with_credentials(mut self, coordinator: CredentialCoordinator) -> Self {
		self.credentials = Some(coordinator);
		self
	}

	/// The configuration
	#[must_use]
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// The domain store
	#[must_use]
	pub fn store(&self) -> &S {
		&self.store
	}

	/// The domain store, mutably
	pub fn store_mut(&mut self) -> &mut S {
		&mut self.store
	}

	/// Apply an administrative action. Status changes reach the directory
	/// with the next export.
	pub async fn admin(
		&mut self,
		username: &str,
		action: AdminAction,
		now: OffsetDateTime,
	) -> Result<Vec<CredentialFailure>, Error> {
		admin::apply(&mut self.store, self.credentials.as_ref(), username, action, now).await
	}

	/// Connect, export, and unbind.
	pub async fn run_export(&mut self) -> Result<PassReport, Error> {
		let mut dir = LdapDirectory::connect(&self.config).await?;
		let result = self.export(&mut dir, OffsetDateTime::now_utc()).await;
		release(&mut dir, result).await
	}

	/// Connect, import, and unbind.
	pub async fn run_import(&mut self) -> Result<PassReport, Error> {
		let mut dir = LdapDirectory::connect(&self.config).await?;
		let result = self.import_users(&mut dir, OffsetDateTime::now_utc()).await;
		release(&mut dir, result).await
	}

	/// Import, then export, over one connection. Importing first lets export
	/// see locks the password policy placed since the last pass.
	pub async fn run_sync(&mut self) -> Result<(PassReport, PassReport), Error> {
		let mut dir = LdapDirectory::connect(&self.config).await?;
		let now = OffsetDateTime::now_utc();
		let result = match self.import_users(&mut dir, now).await {
			Ok(import) => self.export(&mut dir, now).await.map(|export| (import, export)),
			Err(err) => Err(err),
		};
		release(&mut dir, result).await
	}

	/// Fail if a role the platform depends on does not exist.
	fn check_required_roles(&self, domain: &Domain) -> Result<(), Error> {
		let missing: Vec<&str> = self
			.config
			.policy
			.required_roles
			.iter()
			.filter(|name| {
				!domain.roles.iter().any(|role| role.name == **name || role.ldap_name == **name)
			})
			.map(String::as_str)
			.collect();
		if missing.is_empty() {
			Ok(())
		} else {
			Err(Error::Config(format!("Required roles are missing: {}", missing.join(", "))))
		}
	}

	/// Record a status change in the store.
	async fn persist(
		&mut self,
		user: &User,
		entered: Option<UserStatus>,
		now: OffsetDateTime,
		reason: &str,
	) -> Result<Option<StatusEvent>, Error> {
		self.store.save_user(user).await?;
		let Some(status) = entered else { return Ok(None) };
		let event = StatusEvent { user_id: user.id, status, at: now, reason: reason.to_owned() };
		self.store.append_event(&event).await?;
		Ok(Some(event))
	}

	/// Push the domain's state into the directory.
	pub async fn export(
		&mut self,
		dir: &mut dyn Directory,
		now: OffsetDateTime,
	) -> Result<PassReport, Error> {
		let mut domain = self.store.load().await?;
		self.check_required_roles(&domain)?;
		info!("Starting export of {} users", domain.users.len());

		let mut report = PassReport::with_kinds(&EntityKind::ALL);
		let welcome = self.export_users(dir, &mut domain, now, &mut report).await?;
		if let Some(coordinator) = &self.credentials {
			let welcome: Vec<&User> = welcome.iter().collect();
			report.credential_failures.extend(coordinator.welcome(&welcome).await);
		}

		let ctx = MapContext { domain: &domain, config: &self.config, now };
		let (containers, serializers) = (&self.config.containers, &self.serializers);

		let projects = GroupExport {
			kind: EntityKind::Projects,
			container: &containers.projects,
			mapping: &serializers.projects,
			active: domain
				.projects
				.iter()
				.filter(|project| project.status == ProjectStatus::Active)
				.map(|project| {
					(group_name(&project.ldap_name), serializers.dump_project(&ctx, project))
				})
				.collect(),
			disabled: domain
				.projects
				.iter()
				.filter(|project| project.status != ProjectStatus::Active)
				.map(|project| group_name(&project.ldap_name))
				.collect(),
			reserved: BTreeSet::new(),
		};
		self.export_groups(dir, projects, &mut report).await?;

		let roles = GroupExport {
			kind: EntityKind::Roles,
			container: &containers.roles,
			mapping: &serializers.roles,
			active: domain
				.roles
				.iter()
				.map(|role| (group_name(&role.ldap_name), serializers.dump_role(&ctx, role)))
				.collect(),
			disabled: BTreeSet::new(),
			reserved: domain.users.iter().map(|user| group_name(&user.username)).collect(),
		};
		self.export_groups(dir, roles, &mut report).await?;

		let (active, disabled): (Vec<_>, Vec<_>) = domain
			.datasets
			.iter()
			.partition(|dataset| dataset.effective_status(now) == DatasetStatus::Active);
		let datasets = GroupExport {
			kind: EntityKind::Datasets,
			container: &containers.datasets,
			mapping: &serializers.datasets,
			active: active
				.into_iter()
				.map(|dataset| {
					(group_name(&dataset.ldap_name), serializers.dump_dataset(&ctx, dataset))
				})
				.collect(),
			disabled: disabled.into_iter().map(|dataset| group_name(&dataset.ldap_name)).collect(),
			reserved: BTreeSet::new(),
		};
		self.export_groups(dir, datasets, &mut report).await?;

		for (kind, summary) in &report.summaries {
			info!(
				"Exported {kind}: {} created, {} updated, {} deleted, {} errors",
				summary.created, summary.updated, summary.deleted, summary.errors
			);
		}
		Ok(report)
	}

	/// Export every user according to its lifecycle step. Returns the users
	/// that were created from the New status and need a welcome.
	async fn export_users(
		&mut self,
		dir: &mut dyn Directory,
		domain: &mut Domain,
		now: OffsetDateTime,
		report: &mut PassReport,
	) -> Result<Vec<User>, Error> {
		let users = &self.config.containers.users;
		let listing = dir
			.search(Search {
				base: &self.config.search_base(users),
				filter: &users.filter,
				attributes: &USER_ATTRIBUTES,
				page_size: users.page_size,
			})
			.await?;
		let current = keyed(listing, &users.rdn_attribute, str::to_owned);

		let groups = &self.config.containers.private_groups;
		let private_groups = if self.config.policy.user_private_groups {
			let listing = dir
				.search(Search {
					base: &self.config.search_base(groups),
					filter: &groups.filter,
					attributes: &GROUP_ATTRIBUTES,
					page_size: groups.page_size,
				})
				.await?;
			keyed(listing, &groups.rdn_attribute, str::to_owned)
		} else {
			BTreeMap::new()
		};

		let known: BTreeSet<String> = domain
			.users
			.iter()
			.filter(|user| user.status != UserStatus::PendingApproval)
			.map(|user| user.username.clone())
			.collect();
		let all: BTreeSet<String> = domain.users.iter().map(|user| user.username.clone()).collect();
		let set = SyncSet::classify(&known, &BTreeSet::new(), &current.keys().cloned().collect());
		for id in set.unmanaged.iter().filter(|id| !all.contains(*id)) {
			report.summary_mut(EntityKind::Users).unmanaged += 1;
			if self.config.policy.clean_not_in_db {
				if let Some(entry) = current.get(id) {
					delete_entry(dir, EntityKind::Users, id, &entry.dn, report).await;
				}
			} else {
				warn!("User {id} exists only in the directory, leaving it in place");
			}
		}

		let mut welcome = Vec::new();
		for index in 0..domain.users.len() {
			let mut user = domain.users[index].clone();
			let entry = current.get(&user.username);
			let step =
				lifecycle::plan(&user, entry.is_some(), &domain.history, &self.config.policy, now);
			debug!("Lifecycle step for {}: {step:?}", user.username);

			let ctx = MapContext { domain: &*domain, config: &self.config, now };
			let group = private_groups.get(&user.username);
			let outcome = self.export_user(dir, &ctx, &mut user, step, entry, group, report).await;

			let entered = match outcome {
				Ok(entered) => entered,
				Err(Failed { operation, error }) => {
					report.fail(EntityKind::Users, &user.username, operation, &error);
					continue;
				}
			};
			if let Some(status) = entered {
				info!("{} is now {status:?}", user.username);
				if user.status == UserStatus::New {
					welcome.push(user.clone());
				}
				user.status = status;
			}
			if user == domain.users[index] {
				continue;
			}
			match self.persist(&user, entered, now, "directory export").await {
				Ok(event) => {
					if let Some(event) = event {
						domain.history.append(event);
					}
					domain.users[index] = user;
				}
				Err(err) => report.fail(EntityKind::Users, &user.username, "save", &err),
			}
		}
		welcome.retain(|user| {
			domain.user(user.id).is_some_and(|stored| stored.status == UserStatus::Active)
		});
		Ok(welcome)
	}

	/// Bring one user's entries in line. Returns the status the user enters.
	#[allow(clippy::too_many_arguments)]
	async fn export_user(
		&self,
		dir: &mut dyn Directory,
		ctx: &MapContext<'_>,
		user: &mut User,
		step: Step,
		current: Option<&DirectoryEntry>,
		group: Option<&DirectoryEntry>,
		report: &mut PassReport,
	) -> Result<Option<UserStatus>, Failed> {
		match step {
			Step::Skip => {
				if user.status != UserStatus::PendingApproval {
					warn!("{} ({:?}) has no directory entry, skipping", user.username, user.status);
				}
				return Ok(None);
			}
			Step::Create => {
				if user.status == UserStatus::UnlockedByAdmin {
					user.ldap_lock_time = None;
				}
				match current {
					Some(current) => {
						self.patch_user(dir, ctx, user, current, report).await?;
					}
					None => {
						let entry =
							self.serializers.dump_new_user(ctx, user).map_err(at("serialize"))?;
						dir.add(&entry).await.map_err(at("add"))?;
						debug!("Created user {}", user.username);
						report.summary_mut(EntityKind::Users).created += 1;
					}
				}
			}
			Step::Lock { .. } | Step::Unlock | Step::Patch => {
				let Some(current) = current else { return Ok(None) };
				match step {
					Step::Lock { .. } => user.ldap_lock_time = Some(LockTime::Sentinel),
					Step::Unlock => user.ldap_lock_time = None,
					_ => {}
				}
				self.patch_user(dir, ctx, user, current, report).await?;
			}
		}
		self.export_private_group(dir, ctx, user, group, report).await;

		let entered = match step {
			Step::Lock { enter, disable } => {
				if disable {
					self.credential_call(user, false, report).await;
				}
				enter
			}
			Step::Unlock => {
				self.credential_call(user, true, report).await;
				Some(UserStatus::Active)
			}
			Step::Create => match user.status {
				UserStatus::New => Some(UserStatus::Active),
				UserStatus::UnlockedByAdmin => {
					self.credential_call(user, true, report).await;
					Some(UserStatus::Active)
				}
				_ => None,
			},
			Step::Skip | Step::Patch => None,
		};
		Ok(entered)
	}

	/// Apply the attribute differences of a user's entry.
	async fn patch_user(
		&self,
		dir: &mut dyn Directory,
		ctx: &MapContext<'_>,
		user: &User,
		current: &DirectoryEntry,
		report: &mut PassReport,
	) -> Result<(), Failed> {
		let wanted = self.serializers.dump_user(ctx, user).map_err(at("serialize"))?;
		let modifications = attribute_diff(
			current,
			&wanted,
			&self.serializers.users.allowed,
			&self.config.policy.attributes_blacklist,
		);
		if modifications.is_empty() {
			return Ok(());
		}
		debug!("Updating user {}: {modifications:?}", user.username);
		dir.modify(&current.dn, &modifications).await.map_err(at("modify"))?;
		report.summary_mut(EntityKind::Users).updated += 1;
		Ok(())
	}

	/// Create or patch the user's private group, if those are maintained. Only
	/// users who may hold memberships get a missing group created.
	async fn export_private_group(
		&self,
		dir: &mut dyn Directory,
		ctx: &MapContext<'_>,
		user: &User,
		current: Option<&DirectoryEntry>,
		report: &mut PassReport,
	) {
		const KIND: EntityKind = EntityKind::PrivateGroups;
		if !self.config.policy.user_private_groups {
			return;
		}
		let wanted = match self.serializers.dump_private_group(ctx, user) {
			Ok(wanted) => wanted,
			Err(err) => return report.fail(KIND, &user.username, "serialize", &err),
		};
		let Some(current) = current else {
			if !(user.status.is_membership_eligible() || user.status == UserStatus::New) {
				debug!("{} ({:?}) gets no private group", user.username, user.status);
				return;
			}
			match dir.add(&wanted).await {
				Ok(()) => report.summary_mut(KIND).created += 1,
				Err(err) => report.fail(KIND, &user.username, "add", &err),
			}
			return;
		};
		let modifications = attribute_diff(
			current,
			&wanted,
			&self.serializers.private_groups.allowed,
			&self.config.policy.attributes_blacklist,
		);
		if modifications.is_empty() {
			return;
		}
		match dir.modify(&current.dn, &modifications).await {
			Ok(()) => report.summary_mut(KIND).updated += 1,
			Err(err) => report.fail(KIND, &user.username, "modify", &err),
		}
	}

	/// Enable or disable the user's account at the credential provider.
	async fn credential_call(&self, user: &User, enable: bool, report: &mut PassReport) {
		let Some(coordinator) = &self.credentials else { return };
		let result =
			if enable { coordinator.enable(user).await } else { coordinator.disable(user).await };
		if let Err(error) = result {
			warn!("Credential update for {} failed: {error}", user.username);
			let failure = CredentialFailure { username: user.username.clone(), error };
			report.credential_failures.push(failure);
		}
	}

	/// Export one group kind.
	async fn export_groups(
		&self,
		dir: &mut dyn Directory,
		group: GroupExport<'_>,
		report: &mut PassReport,
	) -> Result<(), Error> {
		let GroupExport { kind, container, mapping, mut active, disabled, reserved } = group;
		let listing = dir
			.search(Search {
				base: &self.config.search_base(container),
				filter: &container.filter,
				attributes: &GROUP_ATTRIBUTES,
				page_size: container.page_size,
			})
			.await?;
		let current: BTreeMap<String, DirectoryEntry> =
			keyed(listing, &container.rdn_attribute, group_name)
				.into_iter()
				.filter(|(id, _)| !reserved.contains(id))
				.collect();
		let set = SyncSet::classify(
			&active.keys().cloned().collect(),
			&disabled,
			&current.keys().cloned().collect(),
		);

		for id in &set.unmanaged {
			report.summary_mut(kind).unmanaged += 1;
			if !self.config.policy.clean_not_in_db {
				warn!("{kind} {id} exists only in the directory, leaving it in place");
				continue;
			}
			if let Some(entry) = current.get(id) {
				delete_entry(dir, kind, id, &entry.dn, report).await;
			}
		}

		for id in &set.to_delete {
			if let Some(entry) = current.get(id) {
				delete_entry(dir, kind, id, &entry.dn, report).await;
			}
		}

		for id in &set.to_create {
			match active.remove(id) {
				Some(Ok(entry)) => match dir.add(&entry).await {
					Ok(()) => {
						debug!("Created {kind} {id}");
						report.summary_mut(kind).created += 1;
					}
					Err(err) => report.fail(kind, id, "add", &err),
				},
				Some(Err(err)) => report.fail(kind, id, "serialize", &err),
				None => {}
			}
		}

		for id in &set.to_update {
			let (Some(current), Some(wanted)) = (current.get(id), active.remove(id)) else {
				continue;
			};
			let wanted = match wanted {
				Ok(wanted) => wanted,
				Err(err) => {
					report.fail(kind, id, "serialize", &err);
					continue;
				}
			};
			match self.update_group(dir, mapping, current, &wanted).await {
				Ok(true) => {
					debug!("Updated {kind} {id}");
					report.summary_mut(kind).updated += 1;
				}
				Ok(false) => {}
				Err(Failed { operation, error }) => report.fail(kind, id, operation, &error),
			}
		}
		Ok(())
	}

	/// Patch a group in place, or recreate it if configured so. Groups that
	/// already match are left alone either way. Returns whether anything was
	/// written.
	async fn update_group(
		&self,
		dir: &mut dyn Directory,
		mapping: &KindMapping,
		current: &DirectoryEntry,
		wanted: &DirectoryEntry,
	) -> Result<bool, Failed> {
		let policy = &self.config.policy;
		let modifications =
			attribute_diff(current, wanted, &mapping.allowed, &policy.attributes_blacklist);
		if modifications.is_empty() {
			return Ok(false);
		}
		if !policy.recreate_groups {
			dir.modify(&current.dn, &modifications).await.map_err(at("modify"))?;
			return Ok(true);
		}

		// Some directories reject members referring to the entry being added.
		let mut stripped = wanted.clone();
		stripped.remove_attr(&policy.membership_attribute);
		dir.delete(&current.dn).await.map_err(at("delete"))?;
		dir.add(&stripped).await.map_err(at("add"))?;
		let membership = attribute_diff(&stripped, wanted, &mapping.allowed, &[]);
		if !membership.is_empty() {
			dir.modify(&wanted.dn, &membership).await.map_err(at("modify"))?;
		}
		Ok(true)
	}

	/// Pull authentication times, password change times and locks from the
	/// directory into the user records.
	pub async fn import_users(
		&mut self,
		dir: &mut dyn Directory,
		now: OffsetDateTime,
	) -> Result<PassReport, Error> {
		let domain = self.store.load().await?;
		let users = &self.config.containers.users;
		let entries = dir
			.search(Search {
				base: &self.config.search_base(users),
				filter: &users.filter,
				attributes: &USER_ATTRIBUTES,
				page_size: users.page_size,
			})
			.await?;
		let rdn_attribute = users.rdn_attribute.clone();
		let attribute = |field: &str, fallback: &str| {
			self.serializers.users.spec.attribute_for(field).unwrap_or(fallback).to_owned()
		};
		let auth_attribute = attribute("ldap_last_auth_time", "authTimestamp");
		let pwd_attribute = attribute("ldap_last_pwd_change", "pwdChangedTime");
		let lock_attribute = attribute("ldap_lock_time", "pwdAccountLockedTime");
		info!("Importing {} directory users", entries.len());

		let mut report = PassReport::with_kinds(&[EntityKind::Users]);
		for entry in entries {
			let user = entry.attr_first(&rdn_attribute).and_then(|uid| domain.user_by_name(uid));
			let Some(user) = user else {
				continue;
			};
			let mut imported = user.clone();
			imported.ldap_last_auth_time = imported_time(&entry, &auth_attribute);
			imported.ldap_last_pwd_change = imported_time(&entry, &pwd_attribute);
			let observed = entry.attr_first(&lock_attribute).and_then(|value| {
				let lock = LockTime::parse(value);
				if lock.is_none() {
					warn!("Ignoring {lock_attribute} of {}: {value}", entry.dn);
				}
				lock
			});
			let observation =
				lifecycle::observe_lock(&imported, observed, &self.config.policy, now);
			imported.ldap_lock_time = observation.lock;
			if let Some(status) = observation.enter {
				info!("{} is now {status:?}", imported.username);
				imported.status = status;
			}
			if imported == *user {
				continue;
			}
			match self.persist(&imported, observation.enter, now, "directory import").await {
				Ok(_) => report.summary_mut(EntityKind::Users).updated += 1,
				Err(err) => report.fail(EntityKind::Users, &imported.username, "save", &err),
			}
		}
		Ok(report)
	}
}
