//! Config for the synchronization engine.
use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use ldap3::LdapConnSettings;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{credentials::PasswordPolicy, error::Error};

/// Configuration for which variant of ISO8601 to use for parsing and
/// serializing time. Configured according the syntax definition
/// `( 1.3.6.1.4.1.1466.115.121.1.24 DESC 'Generalized Time' )` described in
/// RFC4517 section 3.1.13
pub const TIME_FORMAT: &[time::format_description::FormatItem] =
	time::macros::format_description!("[year][month][day][hour][minute][second]Z");

/// Lock attribute value meaning "locked, no further detail". The password
/// policy overlay treats it as a permanent lock.
pub const LOCK_SENTINEL: &str = "000001010000Z";

/// Synchronization configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
	/// The URL to connect to the server with. Supports ldap, ldaps, and ldapi
	/// schemes
	pub url: Url,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// The DN to bind as. The account needs write access to all managed
	/// containers.
	pub bind_dn: String,
	/// The password for the bind DN
	pub bind_password: String,
	/// Suffix appended to every container, e.g. `dc=example,dc=org`
	pub base_dn: String,
	/// Where and how each kind of entity is stored in the directory
	#[serde(default)]
	pub containers: Containers,
	/// Fixed attributes written only when a user entry is created
	#[serde(default)]
	pub user_defaults: UserDefaults,
	/// Domain field to directory attribute mappings
	#[serde(default)]
	pub mappings: Mappings,
	/// Reconciliation and account lifecycle policy
	#[serde(default)]
	pub policy: Policy,
	/// Credential provider settings. Without these, credential side effects
	/// are not performed.
	#[serde(default)]
	pub credentials: Option<CredentialsConfig>,
}

impl Config {
	/// Create a configuration using the default containers, mappings and
	/// policy.
	#[must_use]
	pub fn with_defaults(url: Url, base_dn: &str, bind_dn: &str, bind_password: &str) -> Self {
		Self {
			url,
			connection: ConnectionConfig::default(),
			bind_dn: bind_dn.to_owned(),
			bind_password: bind_password.to_owned(),
			base_dn: base_dn.to_owned(),
			containers: Containers::default(),
			user_defaults: UserDefaults::default(),
			mappings: Mappings::default(),
			policy: Policy::default(),
			credentials: None,
		}
	}

	/// Read a YAML configuration file and validate it.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
		let contents = std::fs::read_to_string(path)?;
		let config: Self = serde_yaml::from_str(&contents)?;
		config.validate()?;
		Ok(config)
	}

	/// Reject configurations no pass could run against.
	pub fn validate(&self) -> Result<(), Error> {
		if self.base_dn.trim().is_empty() {
			return Err(Error::Config("base_dn must not be empty".to_owned()));
		}
		if self.bind_dn.trim().is_empty() {
			return Err(Error::Config("bind_dn must not be empty".to_owned()));
		}
		for (kind, container) in self.containers.iter() {
			if container.ou.trim().is_empty() || container.rdn_attribute.trim().is_empty() {
				return Err(Error::Config(format!(
					"The {kind} container needs both an ou and an rdn_attribute"
				)));
			}
			if container.object_classes.is_empty() {
				return Err(Error::Config(format!("The {kind} container has no object classes")));
			}
		}
		if self.policy.lock_duration == 0 {
			return Err(Error::Config("policy.lock_duration must be positive".to_owned()));
		}
		Ok(())
	}

	/// The base a kind-specific subtree search starts at.
	#[must_use]
	pub fn search_base(&self, container: &Container) -> String {
		format!("{},{}", container.ou, self.base_dn)
	}

	/// The distinguished name of an entry with the given local name.
	#[must_use]
	pub fn dn(&self, container: &Container, local_name: &str) -> String {
		format!("{}={},{},{}", container.rdn_attribute, local_name, container.ou, self.base_dn)
	}
}

/// Configuration for how to connect to the LDAP server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,

	/// LDAP operation timeout.
	pub operation_timeout: Duration,

	/// TLS config
	#[serde(default)]
	pub tls: TLSConfig,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self { timeout: 5, operation_timeout: Duration::from_secs(30), tls: TLSConfig::default() }
	}
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TLSConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	pub starttls: bool,

	/// Disable verification of TLS certificates
	pub no_tls_verify: bool,

	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	pub client_certificate_path: Option<PathBuf>,
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let mut roots = RootCertStore::empty();
			let pem = tokio::fs::read(path).await?;
			let certificates = rustls_pemfile::certs(&mut pem.as_slice())?;
			if certificates.is_empty() {
				return Err(Error::Invalid("Could not read root certificate".to_owned()));
			}
			for certificate in certificates {
				roots
					.add(&Certificate(certificate))
					.map_err(|_| Error::Invalid("Could not read root certificate".to_owned()))?;
			}
			let builder =
				ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);

			let client_config =
				match (&self.tls.client_key_path, &self.tls.client_certificate_path) {
					(Some(key_path), Some(cert_path)) => {
						let chain = rustls_pemfile::certs(
							&mut tokio::fs::read(cert_path).await?.as_slice(),
						)?
						.into_iter()
						.map(Certificate)
						.collect();
						let key = rustls_pemfile::pkcs8_private_keys(
							&mut tokio::fs::read(key_path).await?.as_slice(),
						)?
						.into_iter()
						.next()
						.ok_or_else(|| {
							Error::Invalid("Could not read client certificates".to_owned())
						})?;
						builder.with_client_auth_cert(chain, PrivateKey(key)).map_err(|_| {
							Error::Invalid("Could not read client certificates".to_owned())
						})?
					}
					(None, None) => builder.with_no_client_auth(),
					_ => Err(Error::Invalid(
						"Both a client certificate and key file in PKCS8 format must be specified"
							.to_owned(),
					))?,
				};
			settings = settings.set_config(Arc::new(client_config));
		}
		Ok(settings)
	}
}

/// Where one kind of entity lives in the directory tree
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Container {
	/// The container below the base DN, e.g. `ou=People`
	pub ou: String,
	/// The naming attribute of entries in the container
	pub rdn_attribute: String,
	/// The search filter to use when enumerating entries
	pub filter: String,
	/// Object classes of newly created entries
	pub object_classes: Vec<String>,
	/// If set, enables the [simple paged search control] and sets the page size
	/// to the given value
	///
	/// [simple paged search control]: https://www.rfc-editor.org/rfc/rfc2696.html
	#[serde(default)]
	pub page_size: Option<i32>,
}

impl Container {
	fn new(ou: &str, rdn_attribute: &str, filter: &str, object_classes: &[&str]) -> Self {
		Self {
			ou: ou.to_owned(),
			rdn_attribute: rdn_attribute.to_owned(),
			filter: filter.to_owned(),
			object_classes: object_classes.iter().map(|class| (*class).to_owned()).collect(),
			page_size: None,
		}
	}
}

/// Containers for every managed kind of entity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Containers {
	/// User accounts
	pub users: Container,
	/// Per-user private groups. These share the roles' container.
	pub private_groups: Container,
	/// Project groups
	pub projects: Container,
	/// Role groups
	pub roles: Container,
	/// Dataset groups
	pub datasets: Container,
}

impl Containers {
	/// Iterate over the containers with a label for each
	pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Container)> {
		[
			("users", &self.users),
			("private group", &self.private_groups),
			("projects", &self.projects),
			("roles", &self.roles),
			("datasets", &self.datasets),
		]
		.into_iter()
	}
}

impl Default for Containers {
	fn default() -> Self {
		let groups = ["top", "posixGroup", "groupOfMembers", "group"];
		Self {
			users: Container::new(
				"ou=People",
				"uid",
				"(uid=*)",
				&["top", "posixAccount", "inetOrgPerson", "adrfPerson", "shadowAccount"],
			),
			private_groups: Container::new(
				"ou=Groups",
				"cn",
				"(objectClass=posixGroup)",
				&["top", "posixGroup", "groupOfMembers"],
			),
			projects: Container::new(
				"ou=Projects",
				"cn",
				"(&(objectClass=posixGroup)(|(cn=project-*)(cn=yproject-*)))",
				&["top", "adrfProject", "posixGroup", "groupOfMembers", "group"],
			),
			roles: Container::new("ou=Groups", "cn", "(objectClass=posixGroup)", &groups),
			datasets: Container::new("ou=Datasets", "cn", "(objectClass=posixGroup)", &groups),
		}
	}
}

/// Attributes written only when a user entry is created. They are not part
/// of the mapping and so never patched afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserDefaults {
	/// Login shell
	pub login_shell: String,
	/// Home directory, `{username}` is replaced with the user's name
	pub home_directory: String,
	/// Initial value of the `nda` attribute. Left out if unset, for schemas
	/// without it.
	#[serde(default)]
	pub nda: Option<String>,
}

impl Default for UserDefaults {
	fn default() -> Self {
		Self {
			login_shell: "/bin/bash".to_owned(),
			home_directory: "/nfshome/{username}".to_owned(),
			nda: Some("FALSE".to_owned()),
		}
	}
}

/// One mapping rule: a domain field path and the directory attribute it is
/// written to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
	/// Field path in the mapping language, see [`crate::mapping::FieldPath`]
	pub field: String,
	/// Name of the directory attribute
	pub attribute: String,
}

impl MappingRule {
	fn list(rules: &[(&str, &str)]) -> Vec<Self> {
		rules
			.iter()
			.map(|(field, attribute)| Self {
				field: (*field).to_owned(),
				attribute: (*attribute).to_owned(),
			})
			.collect()
	}
}

/// Mapping rules per kind of entity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mappings {
	/// User accounts
	pub users: Vec<MappingRule>,
	/// Per-user private groups
	pub private_groups: Vec<MappingRule>,
	/// Projects
	pub projects: Vec<MappingRule>,
	/// Roles
	pub roles: Vec<MappingRule>,
	/// Datasets
	pub datasets: Vec<MappingRule>,
}

impl Default for Mappings {
	fn default() -> Self {
		Self {
			users: MappingRule::list(&[
				("username", "uid"),
				("first_name", "givenName"),
				("last_name", "sn"),
				("email", "mail"),
				("first_name%last_name", "cn"),
				("ldap_id", "uidNumber"),
				("ldap_id", "gidNumber"),
				("ldap_lock_time", "pwdAccountLockedTime"),
				("ldap_last_auth_time", "authTimestamp"),
				("ldap_ppolicy_configuration_dn", "pwdPolicySubentry"),
				("ldap_last_pwd_change", "pwdChangedTime"),
			]),
			private_groups: MappingRule::list(&[("username", "cn"), ("ldap_id", "gidNumber")]),
			projects: MappingRule::list(&[
				("name", "name"),
				("ldap_name", "cn"),
				("active_members+ldap_full_dn", "member"),
				("abstract", "summary"),
				("created_at", "creationdate"),
				("ldap_id", "gidNumber"),
			]),
			roles: MappingRule::list(&[
				("ldap_name", "cn"),
				("active_users+user|ldap_full_dn", "member"),
				("ldap_id", "gidNumber"),
			]),
			datasets: MappingRule::list(&[
				("ldap_name", "cn"),
				("active_members+ldap_full_dn", "member"),
				("ldap_id", "gidNumber"),
			]),
		}
	}
}

/// Reconciliation and account lifecycle policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
	/// Delete directory entries that have no counterpart in the domain
	pub clean_not_in_db: bool,
	/// Update groups by deleting and re-adding them
	pub recreate_groups: bool,
	/// Maintain a private group for every user
	pub user_private_groups: bool,
	/// Attributes that are always deleted from updated entries
	pub attributes_blacklist: Vec<String>,
	/// Membership attribute stripped from recreated groups before they are
	/// added
	pub membership_attribute: String,
	/// Password policy entry assigned to system users
	pub system_user_ppolicy_dn: Option<String>,
	/// Seconds the password policy keeps an account locked after too many
	/// failed attempts
	pub lock_duration: u64,
	/// Days without a successful authentication before an account is locked
	pub inactivity_days: u64,
	/// Days a password stays valid
	pub max_password_age_days: u64,
	/// Days before expiry from which users are warned
	pub password_warning_days: u64,
	/// Roles that must exist before any pass may run
	pub required_roles: Vec<String>,
}

impl Policy {
	/// The inactivity window
	#[must_use]
	pub fn inactivity_window(&self) -> time::Duration {
		time::Duration::days(i64::try_from(self.inactivity_days).unwrap_or(i64::MAX / 86_400))
	}

	/// The password policy lock window
	#[must_use]
	pub fn lock_window(&self) -> time::Duration {
		time::Duration::seconds(i64::try_from(self.lock_duration).unwrap_or(i64::MAX))
	}
}

impl Default for Policy {
	fn default() -> Self {
		Self {
			clean_not_in_db: false,
			recreate_groups: false,
			user_private_groups: true,
			attributes_blacklist: vec!["memberUid".to_owned()],
			membership_attribute: "member".to_owned(),
			system_user_ppolicy_dn: None,
			lock_duration: 900,
			inactivity_days: 60,
			max_password_age_days: 60,
			password_warning_days: 7,
			required_roles: Vec::new(),
		}
	}
}

/// Settings for the credential provider's admin API
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialsConfig {
	/// Base URL of the provider
	pub url: Url,
	/// Realm the managed accounts live in
	pub realm: String,
	/// Realm the admin account authenticates against
	#[serde(default = "CredentialsConfig::default_token_realm")]
	pub token_realm: String,
	/// Client used for the password grant
	#[serde(default = "CredentialsConfig::default_client_id")]
	pub client_id: String,
	/// Admin user name
	pub admin_user: String,
	/// Admin password
	pub admin_password: String,
	/// Id of the provider's directory federation, used to trigger full syncs
	pub federation_id: String,
	/// Request timeout in seconds
	#[serde(default = "CredentialsConfig::default_timeout")]
	pub timeout: u64,
	/// Temporary password generation policy
	#[serde(default)]
	pub password: PasswordPolicy,
	/// Ask welcomed users to configure a second factor again
	#[serde(default)]
	pub reset_second_factor: bool,
}

impl CredentialsConfig {
	fn default_token_realm() -> String {
		"master".to_owned()
	}

	fn default_client_id() -> String {
		"admin-cli".to_owned()
	}

	const fn default_timeout() -> u64 {
		30
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used, clippy::expect_used, clippy::items_after_statements)]

	use std::{io::ErrorKind, path::PathBuf};

	use time::PrimitiveDateTime;
	use url::Url;

	use super::{Config, TIME_FORMAT};
	use crate::{config::TLSConfig, error, ConnectionConfig};

	fn config() -> Config {
		Config::with_defaults(
			Url::parse("ldap://localhost:1389").unwrap(),
			"dc=example,dc=org",
			"cn=admin,dc=example,dc=org",
			"adminpassword",
		)
	}

	#[test]
	fn test_time_config() -> Result<(), Box<dyn std::error::Error>> {
		PrimitiveDateTime::parse("20130516200520Z", &TIME_FORMAT)?;

		Ok(())
	}

	#[test]
	fn test_dn() {
		let config = config();
		assert_eq!(
			config.dn(&config.containers.users, "johnlennon"),
			"uid=johnlennon,ou=People,dc=example,dc=org"
		);
		assert_eq!(
			config.search_base(&config.containers.datasets),
			"ou=Datasets,dc=example,dc=org"
		);
	}

	#[test]
	fn test_validate() {
		assert!(config().validate().is_ok());

		let mut missing_base = config();
		missing_base.base_dn = " ".to_owned();
		assert!(matches!(missing_base.validate(), Err(error::Error::Config(_))));

		let mut anonymous = config();
		anonymous.bind_dn.clear();
		assert!(matches!(anonymous.validate(), Err(error::Error::Config(_))));

		let mut no_classes = config();
		no_classes.containers.projects.object_classes.clear();
		assert!(matches!(no_classes.validate(), Err(error::Error::Config(_))));
	}

	#[test]
	fn test_yaml_config() -> Result<(), Box<dyn std::error::Error>> {
		let yaml = r#"
url: ldap://localhost:1389
bind_dn: cn=admin,dc=example,dc=org
bind_password: adminpassword
base_dn: dc=example,dc=org
policy:
  clean_not_in_db: true
  lock_duration: 600
"#;
		let config: Config = serde_yaml::from_str(yaml)?;
		config.validate()?;
		assert!(config.policy.clean_not_in_db);
		assert_eq!(config.policy.lock_duration, 600);
		assert_eq!(config.policy.inactivity_days, 60, "Unset policy fields use defaults");
		assert_eq!(config.containers.users.rdn_attribute, "uid");
		assert!(config.credentials.is_none());
		Ok(())
	}

	#[tokio::test]
	async fn test_tls_config() -> Result<(), Box<dyn std::error::Error>> {
		ConnectionConfig::default().to_settings().await?;

		// invalid crt test
		assert!(matches!(
			ConnectionConfig {
				tls: TLSConfig {
					client_key_path: None,
					client_certificate_path: None,
					root_certificates_path: Some(PathBuf::from("src/config.rs")),
					starttls: false,
					no_tls_verify: false,
				},
				timeout: 5,
				operation_timeout: std::time::Duration::from_secs(5),
			}
			.to_settings()
			.await
			.err()
			.unwrap(),
			error::Error::Invalid(_)
		));

		// invalid path test
		assert!(matches!(
			ConnectionConfig {
				tls: TLSConfig {
					client_key_path: Some(PathBuf::from("invalid_path")),
					client_certificate_path: Some(PathBuf::from("invalid_path")),
					root_certificates_path: Some(PathBuf::from("invalid_path")),
					starttls: false,
					no_tls_verify: false,
				},
				timeout: 5,
				operation_timeout: std::time::Duration::from_secs(5),
			}
			.to_settings()
			.await
			.err()
			.unwrap(),
			error::Error::Io(io_err) if io_err.kind() == ErrorKind::NotFound
		));

		Ok(())
	}
}
