use std::{
	collections::BTreeMap,
	error::Error,
	sync::{Arc, Mutex},
};

use async_trait::async_trait;
use ldap3::{LdapConnAsync, SearchEntry};
use ldap_sync::{
	credentials::{
		Account, CredentialCoordinator, CredentialError, CredentialProvider, PasswordPolicy,
	},
	diff::Modification,
	directory::{Directory, Search},
	model::{
		Dataset, DatasetAccess, DatasetStatus, Project, ProjectMember, ProjectRole, ProjectStatus,
		Role, SystemRole, UserRole,
	},
	Config, DirectoryEntry, Domain, User, UserStatus,
};
use time::{macros::datetime, Duration, OffsetDateTime};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use url::Url;

pub const NOW: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::builder().with_default_directive(LevelFilter::DEBUG.into()).from_env_lossy(),
		)
		.with_test_writer()
		.try_init();
}

pub fn config() -> Config {
	Config::with_defaults(
		Url::parse("ldap://localhost:1389").unwrap(),
		"dc=example,dc=org",
		"cn=admin,dc=example,dc=org",
		"adminpassword",
	)
}

pub fn user(id: u64, username: &str, status: UserStatus) -> User {
	let mut user = User::new(id, username, "Ada", "Lovelace", &format!("{username}@example.org"));
	user.ldap_id = Some(1000 + u32::try_from(id).unwrap());
	user.status = status;
	user.created_at = NOW - Duration::days(10);
	user.ldap_last_auth_time = Some(NOW - Duration::days(1));
	user
}

/// Two active users in one project, an instructor role held by one of them,
/// and a private dataset the project can read.
pub fn domain() -> Domain {
	let since = Some(NOW - Duration::days(5));
	Domain {
		users: vec![user(1, "alice", UserStatus::Active), user(2, "bob", UserStatus::Active)],
		roles: vec![Role {
			id: 10,
			name: "Instructors".to_owned(),
			ldap_name: "instructors".to_owned(),
			ldap_id: Some(5000),
			description: None,
		}],
		user_roles: vec![UserRole { user_id: 1, role_id: 10, begin: since, end: None }],
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
		project_members: vec![ProjectMember {
			project_id: 20,
			user_id: 2,
			role_id: 30,
			start_date: since,
			end_date: None,
		}],
		datasets: vec![Dataset {
			id: 40,
			dataset_id: "adrf-000001".to_owned(),
			name: "Food purchases".to_owned(),
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
		history: Default::default(),
	}
}

/// A recorded directory write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
	Add(String),
	Modify(String, Vec<Modification>),
	Delete(String),
}

/// A directory kept in memory. It enforces what a real server would: no
/// duplicate entries, no adding existing values, no deleting missing ones.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
	pub entries: BTreeMap<String, DirectoryEntry>,
	pub ops: Vec<Op>,
	/// Writes to DNs containing this text are rejected
	pub reject: Option<String>,
}

fn key(dn: &str) -> String {
	dn.to_ascii_lowercase()
}

fn rejected(operation: &'static str, dn: &str, message: &str) -> ldap_sync::Error {
	ldap_sync::Error::Rejected { operation, dn: dn.to_owned(), message: message.to_owned() }
}

impl MemoryDirectory {
	pub fn with(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
		Self {
			entries: entries.into_iter().map(|entry| (key(&entry.dn), entry)).collect(),
			..Self::default()
		}
	}

	pub fn get(&self, dn: &str) -> Option<&DirectoryEntry> {
		self.entries.get(&key(dn))
	}

	pub fn get_mut(&mut self, dn: &str) -> Option<&mut DirectoryEntry> {
		self.entries.get_mut(&key(dn))
	}

	fn check(&self, operation: &'static str, dn: &str) -> Result<(), ldap_sync::Error> {
		match &self.reject {
			Some(text) if dn.contains(text.as_str()) => {
				Err(rejected(operation, dn, "insufficient access"))
			}
			_ => Ok(()),
		}
	}
}

fn apply(entry: &mut DirectoryEntry, modification: &Modification) -> Result<(), String> {
	let attribute = modification.attribute();
	let name = entry
		.attrs
		.keys()
		.find(|name| name.eq_ignore_ascii_case(attribute))
		.cloned()
		.unwrap_or_else(|| attribute.to_owned());
	match modification {
		Modification::Add(_, value) => {
			let values = entry.attrs.entry(name).or_default();
			if values.contains(value) {
				return Err(format!("{attribute}: value exists"));
			}
			values.push(value.clone());
		}
		Modification::Delete(_, value) => {
			let values =
				entry.attrs.get_mut(&name).ok_or(format!("{attribute}: no such attribute"))?;
			let index = values
				.iter()
				.position(|candidate| candidate == value)
				.ok_or(format!("{attribute}: no such value"))?;
			values.remove(index);
			if values.is_empty() {
				entry.attrs.remove(&name);
			}
		}
		Modification::Replace(_, value) => {
			entry.attrs.insert(name, vec![value.clone()]);
		}
	}
	Ok(())
}

#[async_trait]
impl Directory for MemoryDirectory {
	async fn search(
		&mut self,
		search: Search<'_>,
	) -> Result<Vec<DirectoryEntry>, ldap_sync::Error> {
		let suffix = format!(",{}", key(search.base));
		Ok(self
			.entries
			.iter()
			.filter(|(dn, _)| dn.ends_with(&suffix))
			.map(|(_, entry)| entry.clone())
			.collect())
	}

	async fn add(&mut self, entry: &DirectoryEntry) -> Result<(), ldap_sync::Error> {
		self.check("add", &entry.dn)?;
		if self.entries.contains_key(&key(&entry.dn)) {
			return Err(rejected("add", &entry.dn, "already exists"));
		}
		self.entries.insert(key(&entry.dn), entry.clone());
		self.ops.push(Op::Add(entry.dn.clone()));
		Ok(())
	}

	async fn modify(
		&mut self,
		dn: &str,
		modifications: &[Modification],
	) -> Result<(), ldap_sync::Error> {
		if modifications.is_empty() {
			return Ok(());
		}
		self.check("modify", dn)?;
		let mut entry =
			self.get(dn).cloned().ok_or_else(|| rejected("modify", dn, "no such object"))?;
		for modification in modifications {
			apply(&mut entry, modification).map_err(|message| rejected("modify", dn, &message))?;
		}
		self.entries.insert(key(dn), entry);
		self.ops.push(Op::Modify(dn.to_owned(), modifications.to_vec()));
		Ok(())
	}

	async fn delete(&mut self, dn: &str) -> Result<(), ldap_sync::Error> {
		self.check("delete", dn)?;
		self.entries.remove(&key(dn)).ok_or_else(|| rejected("delete", dn, "no such object"))?;
		self.ops.push(Op::Delete(dn.to_owned()));
		Ok(())
	}

	async fn unbind(&mut self) -> Result<(), ldap_sync::Error> {
		Ok(())
	}
}

/// Credential provider double recording every write
#[derive(Debug, Default)]
pub struct RecordingProvider {
	pub accounts: Mutex<BTreeMap<String, Account>>,
	pub calls: Mutex<Vec<String>>,
	/// Mail addresses whose account updates are refused
	pub failing: Mutex<Vec<String>>,
}

impl RecordingProvider {
	pub fn with_accounts(emails: &[&str]) -> Arc<Self> {
		let provider = Self::default();
		for email in emails {
			provider.accounts.lock().unwrap().insert(
				(*email).to_owned(),
				Account {
					id: format!("id-{email}"),
					username: (*email).to_owned(),
					email: Some((*email).to_owned()),
					enabled: true,
					required_actions: Vec::new(),
					other: serde_json::Map::new(),
				},
			);
		}
		Arc::new(provider)
	}

	pub fn calls(&self) -> Vec<String> {
		self.calls.lock().unwrap().clone()
	}

	pub fn set_enabled(&self, email: &str, enabled: bool) {
		self.accounts.lock().unwrap().get_mut(email).unwrap().enabled = enabled;
	}

	pub fn fail_updates(&self, email: &str) {
		self.failing.lock().unwrap().push(email.to_owned());
	}

	pub fn coordinator(self: &Arc<Self>) -> CredentialCoordinator {
		CredentialCoordinator::new(self.clone(), PasswordPolicy::default())
	}
}

#[async_trait]
impl CredentialProvider for RecordingProvider {
	async fn full_sync(&self) -> Result<(), CredentialError> {
		self.calls.lock().unwrap().push("sync".to_owned());
		Ok(())
	}

	async fn find_account(&self, email: &str) -> Result<Option<Account>, CredentialError> {
		Ok(self.accounts.lock().unwrap().get(email).cloned())
	}

	async fn reset_password(
		&self,
		account_id: &str,
		_password: &str,
		temporary: bool,
	) -> Result<(), CredentialError> {
		self.calls.lock().unwrap().push(format!("reset {account_id} {temporary}"));
		Ok(())
	}

	async fn update_account(&self, account: &Account) -> Result<(), CredentialError> {
		self.calls.lock().unwrap().push(format!("update {} {}", account.id, account.enabled));
		let failing = self.failing.lock().unwrap();
		if account.email.as_ref().is_some_and(|email| failing.contains(email)) {
			return Err(CredentialError::Status {
				status: 503,
				url: format!("users/{}", account.id),
				body: "unavailable".to_owned(),
			});
		}
		drop(failing);
		if let Some(email) = &account.email {
			self.accounts.lock().unwrap().insert(email.clone(), account.clone());
		}
		Ok(())
	}
}

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost:1389").await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?;
	Ok(ldap)
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("ou={},dc=example,dc=org", ou),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_subtree(ldap: &mut ldap3::Ldap, ou: &str) -> Result<(), Box<dyn Error>> {
	let base = format!("ou={},dc=example,dc=org", ou);
	let (entries, _res) = ldap
		.search(&base, ldap3::Scope::OneLevel, "(objectClass=*)", vec!["1.1"])
		.await?
		.success()?;
	for entry in entries {
		ldap.delete(&SearchEntry::construct(entry).dn).await?.success()?;
	}
	ldap.delete(&base).await?.success()?;
	Ok(())
}

pub async fn ldap_search(ldap: &mut ldap3::Ldap, dn: &str) -> Result<SearchEntry, Box<dyn Error>> {
	let (result, _res) = ldap
		.search(dn, ldap3::Scope::Base, "(objectClass=*)", vec!["*"])
		.await?
		.success()?;
	let entry = result.first().ok_or("No entry found")?.clone();
	Ok(SearchEntry::construct(entry))
}
