//! Per-kind serializers turning domain records into directory entries.
//!
//! Every record is exposed to the mapping language through a view that knows
//! the record's directory name and the evaluation time, so derived fields
//! such as `active_members` or `ldap_full_dn` resolve against one consistent
//! snapshot.
use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::{
	config::{Config, Container, MappingRule},
	diff::{allowed_attributes, VOLATILE_ATTRIBUTES},
	entry::DirectoryEntry,
	error::Error,
	mapping::{Mappable, MappingError, MappingSpec, Value},
	model::{Dataset, Domain, Project, Role, User, UserRole},
};

/// What mapped fields are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MapContext<'a> {
	/// The domain snapshot
	pub domain: &'a Domain,
	/// The configuration, for directory names
	pub config: &'a Config,
	/// Reference time for time-bounded memberships
	pub now: OffsetDateTime,
}

fn text(value: &str) -> Option<Value<'static>> {
	Some(Value::Text(value.to_owned()))
}

fn id(value: Option<u32>) -> Option<Value<'static>> {
	value.map(|value| Value::Integer(i64::from(value)))
}

fn users<'a>(ctx: &'a MapContext<'a>, users: Vec<&'a User>) -> Option<Value<'a>> {
	Some(Value::Collection(
		users
			.into_iter()
			.map(|user| Box::new(UserView { ctx, user }) as Box<dyn Mappable + 'a>)
			.collect(),
	))
}

/// Mapping view of a [`User`]
#[derive(Debug, Clone, Copy)]
pub struct UserView<'a> {
	/// Evaluation context
	pub ctx: &'a MapContext<'a>,
	/// The user
	pub user: &'a User,
}

impl Mappable for UserView<'_> {
	fn field(&self, name: &str) -> Result<Option<Value<'_>>, MappingError> {
		let user = self.user;
		Ok(match name {
			"id" => Some(Value::Integer(i64::try_from(user.id).unwrap_or(i64::MAX))),
			"username" => text(&user.username),
			"first_name" => text(&user.first_name),
			"last_name" => text(&user.last_name),
			"full_name" => text(&user.full_name()),
			"email" => text(&user.email),
			"status" => text(&format!("{:?}", user.status)),
			"ldap_id" => id(user.ldap_id),
			"created_at" => Some(Value::Time(user.created_at)),
			"ldap_lock_time" => user.ldap_lock_time.map(Value::Lock),
			"ldap_last_auth_time" => user.ldap_last_auth_time.map(Value::Time),
			"ldap_last_pwd_change" => user.ldap_last_pwd_change.map(Value::Time),
			"ldap_ppolicy_configuration_dn" => {
				if user.system_user {
					self.ctx.config.policy.system_user_ppolicy_dn.as_deref().and_then(text)
				} else {
					None
				}
			}
			"ldap_full_dn" => {
				text(&self.ctx.config.dn(&self.ctx.config.containers.users, &user.username))
			}
			_ => return Err(MappingError::UnknownField(name.to_owned())),
		})
	}
}

/// Mapping view of a user's private group. Fields not specific to the group
/// are read from the owning user.
#[derive(Debug, Clone, Copy)]
pub struct PrivateGroupView<'a> {
	/// The owning user
	pub owner: UserView<'a>,
}

impl Mappable for PrivateGroupView<'_> {
	fn field(&self, name: &str) -> Result<Option<Value<'_>>, MappingError> {
		let UserView { ctx, user } = self.owner;
		match name {
			"ldap_full_dn" => {
				Ok(text(&ctx.config.dn(&ctx.config.containers.private_groups, &user.username)))
			}
			"user" => Ok(Some(Value::Object(Box::new(self.owner)))),
			_ => self.owner.field(name),
		}
	}
}

/// Mapping view of a [`Project`]
#[derive(Debug, Clone, Copy)]
pub struct ProjectView<'a> {
	/// Evaluation context
	pub ctx: &'a MapContext<'a>,
	/// The project
	pub project: &'a Project,
}

impl Mappable for ProjectView<'_> {
	fn field(&self, name: &str) -> Result<Option<Value<'_>>, MappingError> {
		let project = self.project;
		Ok(match name {
			"id" => Some(Value::Integer(i64::try_from(project.id).unwrap_or(i64::MAX))),
			"name" => text(&project.name),
			"ldap_name" => text(&group_name(&project.ldap_name)),
			"ldap_id" => id(project.ldap_id),
			"abstract" => text(&project.abstract_text),
			"status" => text(&format!("{:?}", project.status)),
			"created_at" => Some(Value::Time(project.created_at)),
			"ldap_full_dn" => {
				let name = group_name(&project.ldap_name);
				text(&self.ctx.config.dn(&self.ctx.config.containers.projects, &name))
			}
			"active_members" => {
				users(self.ctx, self.ctx.domain.project_members(project, self.ctx.now))
			}
			"instructors" => project
				.instructors
				.and_then(|role_id| self.ctx.domain.roles.iter().find(|role| role.id == role_id))
				.map(|role| Value::Object(Box::new(RoleView { ctx: self.ctx, role }))),
			_ => return Err(MappingError::UnknownField(name.to_owned())),
		})
	}
}

/// Mapping view of a [`Role`]
#[derive(Debug, Clone, Copy)]
pub struct RoleView<'a> {
	/// Evaluation context
	pub ctx: &'a MapContext<'a>,
	/// The role
	pub role: &'a Role,
}

impl Mappable for RoleView<'_> {
	fn field(&self, name: &str) -> Result<Option<Value<'_>>, MappingError> {
		let role = self.role;
		Ok(match name {
			"id" => Some(Value::Integer(i64::try_from(role.id).unwrap_or(i64::MAX))),
			"name" => text(&role.name),
			"ldap_name" => text(&group_name(&role.ldap_name)),
			"ldap_id" => id(role.ldap_id),
			"description" => role.description.as_deref().and_then(text),
			"ldap_full_dn" => {
				let name = group_name(&role.ldap_name);
				text(&self.ctx.config.dn(&self.ctx.config.containers.roles, &name))
			}
			"active_users" => Some(Value::Collection(
				self.ctx
					.domain
					.active_role_grants(role.id, self.ctx.now)
					.map(|(grant, user)| {
						let view = UserRoleView { ctx: self.ctx, grant, user, role };
						Box::new(view) as Box<dyn Mappable + '_>
					})
					.collect(),
			)),
			"active_members" => {
				users(self.ctx, self.ctx.domain.role_members(role.id, self.ctx.now))
			}
			_ => return Err(MappingError::UnknownField(name.to_owned())),
		})
	}
}

/// Mapping view of a role grant
#[derive(Debug, Clone, Copy)]
pub struct UserRoleView<'a> {
	/// Evaluation context
	pub ctx: &'a MapContext<'a>,
	/// The grant
	pub grant: &'a UserRole,
	/// The granted user
	pub user: &'a User,
	/// The granted role
	pub role: &'a Role,
}

impl Mappable for UserRoleView<'_> {
	fn field(&self, name: &str) -> Result<Option<Value<'_>>, MappingError> {
		Ok(match name {
			"user" => Some(Value::Object(Box::new(UserView { ctx: self.ctx, user: self.user }))),
			"role" => Some(Value::Object(Box::new(RoleView { ctx: self.ctx, role: self.role }))),
			"begin" => self.grant.begin.map(Value::Time),
			"end" => self.grant.end.map(Value::Time),
			_ => return Err(MappingError::UnknownField(name.to_owned())),
		})
	}
}

/// Mapping view of a [`Dataset`]
#[derive(Debug, Clone, Copy)]
pub struct DatasetView<'a> {
	/// Evaluation context
	pub ctx: &'a MapContext<'a>,
	/// The dataset
	pub dataset: &'a Dataset,
}

impl Mappable for DatasetView<'_> {
	fn field(&self, name: &str) -> Result<Option<Value<'_>>, MappingError> {
		let dataset = self.dataset;
		Ok(match name {
			"id" => Some(Value::Integer(i64::try_from(dataset.id).unwrap_or(i64::MAX))),
			"dataset_id" => text(&dataset.dataset_id),
			"name" => text(&dataset.name),
			"ldap_name" => text(&group_name(&dataset.ldap_name)),
			"ldap_id" => id(dataset.ldap_id),
			"public" => text(if dataset.public { "TRUE" } else { "FALSE" }),
			"expiration" => dataset.expiration.map(Value::Time),
			"ldap_full_dn" => {
				let name = group_name(&dataset.ldap_name);
				text(&self.ctx.config.dn(&self.ctx.config.containers.datasets, &name))
			}
			"active_members" => {
				users(self.ctx, self.ctx.domain.dataset_members(dataset, self.ctx.now))
			}
			_ => return Err(MappingError::UnknownField(name.to_owned())),
		})
	}
}

/// Group identifiers are compared and written lower-cased.
#[must_use]
pub fn group_name(name: &str) -> String {
	name.to_lowercase()
}

/// Compiled mappings of every kind, with the attribute sets export may touch.
#[derive(Debug, Clone)]
pub struct Serializers {
	/// User accounts
	pub users: KindMapping,
	/// Private groups
	pub private_groups: KindMapping,
	/// Projects
	pub projects: KindMapping,
	/// Roles
	pub roles: KindMapping,
	/// Datasets
	pub datasets: KindMapping,
}

/// The mapping of one kind
#[derive(Debug, Clone)]
pub struct KindMapping {
	/// Compiled rules
	pub spec: MappingSpec,
	/// Attributes export compares, see [`allowed_attributes`]
	pub allowed: BTreeSet<String>,
}

impl KindMapping {
	fn compile(kind: &str, rules: &[MappingRule], container: &Container) -> Result<Self, Error> {
		let spec = MappingSpec::compile(rules)
			.map_err(|err| Error::Config(format!("The {kind} mapping is invalid: {err}")))?;
		let allowed = allowed_attributes(&spec.attributes());
		let rdn = &container.rdn_attribute;
		if !allowed.iter().any(|attribute| attribute.eq_ignore_ascii_case(rdn)) {
			return Err(Error::Config(format!(
				"The {kind} mapping does not write the naming attribute {}",
				container.rdn_attribute
			)));
		}
		Ok(Self { spec, allowed })
	}

	/// Map an object into a new entry with the container's object classes.
	fn dump(
		&self,
		object: &dyn Mappable,
		dn: String,
		container: &Container,
	) -> Result<DirectoryEntry, Error> {
		let mut entry = DirectoryEntry::new(dn);
		entry.extend_attr("objectClass", container.object_classes.iter().cloned());
		self.spec.apply(object, &mut entry)?;
		Ok(entry)
	}
}

impl Serializers {
	/// Compile the configured mappings. Fails if a rule does not parse or a
	/// mapping does not produce the naming attribute of its container.
	pub fn new(config: &Config) -> Result<Self, Error> {
		let (mappings, containers) = (&config.mappings, &config.containers);
		Ok(Self {
			users: KindMapping::compile("users", &mappings.users, &containers.users)?,
			private_groups: KindMapping::compile(
				"private group",
				&mappings.private_groups,
				&containers.private_groups,
			)?,
			projects: KindMapping::compile("projects", &mappings.projects, &containers.projects)?,
			roles: KindMapping::compile("roles", &mappings.roles, &containers.roles)?,
			datasets: KindMapping::compile("datasets", &mappings.datasets, &containers.datasets)?,
		})
	}

	/// The user's entry as export maintains it.
	pub fn dump_user(&self, ctx: &MapContext<'_>, user: &User) -> Result<DirectoryEntry, Error> {
		let container = &ctx.config.containers.users;
		let view = UserView { ctx, user };
		self.users.dump(&view, ctx.config.dn(container, &user.username), container)
	}

	/// The user's entry as it is created: the maintained attributes plus the
	/// fixed defaults, without anything the directory maintains itself.
	pub fn dump_new_user(
		&self,
		ctx: &MapContext<'_>,
		user: &User,
	) -> Result<DirectoryEntry, Error> {
		let mut entry = self.dump_user(ctx, user)?;
		let defaults = &ctx.config.user_defaults;
		entry.set_attr("loginShell", vec![defaults.login_shell.clone()]);
		let home = defaults.home_directory.replace("{username}", &user.username);
		entry.set_attr("homeDirectory", vec![home]);
		if let Some(nda) = &defaults.nda {
			entry.set_attr("nda", vec![nda.clone()]);
		}
		for attribute in VOLATILE_ATTRIBUTES {
			entry.remove_attr(attribute);
		}
		Ok(entry)
	}

	/// The private group mirroring the user.
	pub fn dump_private_group(
		&self,
		ctx: &MapContext<'_>,
		user: &User,
	) -> Result<DirectoryEntry, Error> {
		let container = &ctx.config.containers.private_groups;
		let view = PrivateGroupView { owner: UserView { ctx, user } };
		self.private_groups.dump(&view, ctx.config.dn(container, &user.username), container)
	}

	/// The project's group.
	pub fn dump_project(
		&self,
		ctx: &MapContext<'_>,
		project: &Project,
	) -> Result<DirectoryEntry, Error> {
		let container = &ctx.config.containers.projects;
		let view = ProjectView { ctx, project };
		let dn = ctx.config.dn(container, &group_name(&project.ldap_name));
		self.projects.dump(&view, dn, container)
	}

	/// The role's group.
	pub fn dump_role(&self, ctx: &MapContext<'_>, role: &Role) -> Result<DirectoryEntry, Error> {
		let container = &ctx.config.containers.roles;
		let view = RoleView { ctx, role };
		self.roles.dump(&view, ctx.config.dn(container, &group_name(&role.ldap_name)), container)
	}

	/// The dataset's group.
	pub fn dump_dataset(
		&self,
		ctx: &MapContext<'_>,
		dataset: &Dataset,
	) -> Result<DirectoryEntry, Error> {
		let container = &ctx.config.containers.datasets;
		let view = DatasetView { ctx, dataset };
		let dn = ctx.config.dn(container, &group_name(&dataset.ldap_name));
		self.datasets.dump(&view, dn, container)
	}
}
