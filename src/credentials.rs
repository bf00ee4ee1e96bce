//! Credential side effects at the identity provider.
//!
//! The provider federates the directory for authentication and owns the
//! credential and second factor lifecycle. Lifecycle transitions of the
//! directory export are mirrored to it through the [`CredentialCoordinator`].
//! Provider failures are reported per user and never abort a pass.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::{seq::SliceRandom, Rng};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{config::CredentialsConfig, model::User};

/// Errors talking to the credential provider
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
	/// The provider could not be reached
	#[error("Credential provider unreachable: {0}")]
	Connectivity(String),
	/// The provider answered with an unexpected status
	#[error("Credential provider returned {status} for {url}: {body}")]
	Status {
		/// HTTP status code
		status: u16,
		/// Requested URL
		url: String,
		/// Response body
		body: String,
	},
	/// The provider asked us to slow down
	#[error("Credential provider rate limit reached")]
	RateLimited,
	/// The admin login was refused or the token expired
	#[error("Not authenticated at the credential provider")]
	NotAuthenticated,
	/// A response could not be parsed
	#[error("Malformed credential provider response: {0}")]
	Malformed(String),
	/// The provider has no account for the mail address
	#[error("No provider account for {0}")]
	UnknownAccount(String),
	/// The welcome notification could not be sent
	#[error("Notification failed: {0}")]
	Notification(String),
}

impl From<reqwest::Error> for CredentialError {
	fn from(err: reqwest::Error) -> Self {
		if err.is_decode() {
			Self::Malformed(err.to_string())
		} else {
			Self::Connectivity(err.to_string())
		}
	}
}

/// A character class of generated passwords
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharClass {
	/// Upper case letters without `O`
	Upper,
	/// Lower case letters without `l`
	Lower,
	/// Digits
	Digit,
	/// Symbols
	Symbol,
}

impl CharClass {
	/// All classes, in default order
	pub const ALL: [Self; 4] = [Self::Upper, Self::Lower, Self::Digit, Self::Symbol];

	/// Characters drawn from for this class
	#[must_use]
	pub fn charset(self) -> &'static [u8] {
		match self {
			Self::Upper => b"ABCDEFGHIJKLMNPQRSTUVWXYZ",
			Self::Lower => b"abcdefghijkmnopqrstuvwxyz",
			Self::Digit => b"0123456789",
			Self::Symbol => b"!@#$%^&*?<>",
		}
	}
}

/// How temporary passwords are generated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
	/// Number of characters
	pub length: usize,
	/// Classes, cycled through position by position
	pub classes: Vec<CharClass>,
}

impl Default for PasswordPolicy {
	fn default() -> Self {
		Self { length: 12, classes: CharClass::ALL.to_vec() }
	}
}

impl PasswordPolicy {
	/// Generate a password with the thread-local generator.
	#[must_use]
	pub fn generate(&self) -> String {
		self.generate_with(&mut rand::thread_rng())
	}

	/// Generate a password. Position `i` draws from `classes[i % len]`.
	pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
		let classes = if self.classes.is_empty() { &CharClass::ALL[..] } else { &self.classes[..] };
		classes
			.iter()
			.cycle()
			.take(self.length)
			.filter_map(|class| class.charset().choose(rng))
			.map(|byte| char::from(*byte))
			.collect()
	}
}

/// Follow-up actions the provider forces on the next login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequiredAction {
	/// Choose a new password
	UpdatePassword,
	/// Enroll a new second factor
	ConfigureTotp,
	/// Any other action, such as `VERIFY_EMAIL`, kept as the provider named it
	Other(String),
}

impl From<String> for RequiredAction {
	fn from(name: String) -> Self {
		match name.as_str() {
			"UPDATE_PASSWORD" => Self::UpdatePassword,
			"CONFIGURE_TOTP" => Self::ConfigureTotp,
			_ => Self::Other(name),
		}
	}
}

impl From<RequiredAction> for String {
	fn from(action: RequiredAction) -> Self {
		match action {
			RequiredAction::UpdatePassword => "UPDATE_PASSWORD".to_owned(),
			RequiredAction::ConfigureTotp => "CONFIGURE_TOTP".to_owned(),
			RequiredAction::Other(name) => name,
		}
	}
}

/// An account at the provider. Fields not used here are kept so updates
/// write the full record back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
	/// Provider id
	pub id: String,
	/// Login name
	#[serde(default)]
	pub username: String,
	/// Mail address
	#[serde(default)]
	pub email: Option<String>,
	/// Whether logins are allowed
	#[serde(default)]
	pub enabled: bool,
	/// Actions forced on the next login
	#[serde(default)]
	pub required_actions: Vec<RequiredAction>,
	/// Everything else the provider returned
	#[serde(flatten)]
	pub other: serde_json::Map<String, serde_json::Value>,
}

/// Admin operations of the identity provider
#[async_trait]
pub trait CredentialProvider: Send + Sync {
	/// Make the provider re-read every account from the directory.
	async fn full_sync(&self) -> Result<(), CredentialError>;
	/// Find the account with the given mail address.
	async fn find_account(&self, email: &str) -> Result<Option<Account>, CredentialError>;
	/// Set a password, optionally forcing rotation on the next login.
	async fn reset_password(
		&self,
		account_id: &str,
		password: &str,
		temporary: bool,
	) -> Result<(), CredentialError>;
	/// Write an account record back.
	async fn update_account(&self, account: &Account) -> Result<(), CredentialError>;
}

/// Delivers the temporary password of a newly created account
#[async_trait]
pub trait Notifier: Send + Sync {
	/// Tell the user their account is ready.
	async fn welcome(&self, user: &User, password: &str) -> Result<(), CredentialError>;
}

/// Answer of the token endpoint
#[derive(Deserialize)]
struct TokenResponse {
	/// Bearer token
	access_token: String,
}

/// Keycloak admin REST client
pub struct KeycloakClient {
	/// HTTP client
	http: Client,
	/// Provider settings
	config: CredentialsConfig,
	/// Bearer token of the admin login, fetched on first use
	token: Mutex<Option<String>>,
}

impl std::fmt::Debug for KeycloakClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeycloakClient")
			.field("url", &self.config.url.as_str())
			.field("realm", &self.config.realm)
			.finish_non_exhaustive()
	}
}

impl KeycloakClient {
	/// Create a client. No request is made until the first operation.
	pub fn new(config: CredentialsConfig) -> Result<Self, CredentialError> {
		let http = Client::builder().timeout(Duration::from_secs(config.timeout)).build()?;
		Ok(Self { http, config, token: Mutex::new(None) })
	}

	fn base(&self) -> &str {
		self.config.url.as_str().trim_end_matches('/')
	}

	fn admin_url(&self, path: &str) -> String {
		format!("{}/auth/admin/realms/{}/{path}", self.base(), self.config.realm)
	}

	async fn token(&self) -> Result<String, CredentialError> {
		let mut token = self.token.lock().await;
		if let Some(token) = token.as_ref() {
			return Ok(token.clone());
		}
		let url = format!(
			"{}/auth/realms/{}/protocol/openid-connect/token",
			self.base(),
			self.config.token_realm
		);
		debug!("Requesting admin token from {url}");
		let response = self
			.http
			.post(&url)
			.form(&[
				("username", self.config.admin_user.as_str()),
				("password", self.config.admin_password.as_str()),
				("grant_type", "password"),
				("client_id", self.config.client_id.as_str()),
			])
			.send()
			.await?;
		let response = check(response).await?;
		let access_token = response.json::<TokenResponse>().await?.access_token;
		*token = Some(access_token.clone());
		Ok(access_token)
	}

	/// Send an authenticated request. A rejected token is dropped so the next
	/// request logs in again.
	async fn send(&self, request: RequestBuilder) -> Result<Response, CredentialError> {
		let token = self.token().await?;
		let result = check(request.bearer_auth(token).send().await?).await;
		if matches!(result, Err(CredentialError::NotAuthenticated)) {
			*self.token.lock().await = None;
		}
		result
	}
}

/// Map error statuses to errors.
async fn check(response: Response) -> Result<Response, CredentialError> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}
	match status {
		StatusCode::UNAUTHORIZED => Err(CredentialError::NotAuthenticated),
		StatusCode::TOO_MANY_REQUESTS => Err(CredentialError::RateLimited),
		_ => {
			let url = response.url().to_string();
			let body = response.text().await.unwrap_or_default();
			Err(CredentialError::Status { status: status.as_u16(), url, body })
		}
	}
}

#[async_trait]
impl CredentialProvider for KeycloakClient {
	async fn full_sync(&self) -> Result<(), CredentialError> {
		let url = self.admin_url(&format!("user-storage/{}/sync", self.config.federation_id));
		self.send(self.http.post(url).query(&[("action", "triggerFullSync")])).await?;
		info!("Triggered a full directory sync at the credential provider");
		Ok(())
	}

	async fn find_account(&self, email: &str) -> Result<Option<Account>, CredentialError> {
		let request = self.http.get(self.admin_url("users")).query(&[("search", email)]);
		let response = self.send(request).await?;
		let accounts: Vec<Account> = response.json().await?;
		Ok(accounts.into_iter().find(|account| {
			account.email.as_deref().is_some_and(|candidate| candidate.eq_ignore_ascii_case(email))
		}))
	}

	async fn reset_password(
		&self,
		account_id: &str,
		password: &str,
		temporary: bool,
	) -> Result<(), CredentialError> {
		let url = self.admin_url(&format!("users/{account_id}/reset-password"));
		let body =
			serde_json::json!({ "type": "password", "value": password, "temporary": temporary });
		self.send(self.http.put(url).json(&body)).await?;
		Ok(())
	}

	async fn update_account(&self, account: &Account) -> Result<(), CredentialError> {
		let url = self.admin_url(&format!("users/{}", account.id));
		self.send(self.http.put(url).json(account)).await?;
		Ok(())
	}
}

/// Per-user failure of a credential side effect
#[derive(Debug)]
pub struct CredentialFailure {
	/// Login name of the affected user
	pub username: String,
	/// What went wrong
	pub error: CredentialError,
}

/// Mirrors account lifecycle transitions to the credential provider.
#[derive(Clone)]
pub struct CredentialCoordinator {
	provider: Arc<dyn CredentialProvider>,
	notifier: Option<Arc<dyn Notifier>>,
	password: PasswordPolicy,
	reset_second_factor: bool,
}

impl std::fmt::Debug for CredentialCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CredentialCoordinator")
			.field("password", &self.password)
			.field("reset_second_factor", &self.reset_second_factor)
			.finish_non_exhaustive()
	}
}

impl CredentialCoordinator {
	/// Create a coordinator for a provider.
	#[must_use]
	pub fn new(provider: Arc<dyn CredentialProvider>, password: PasswordPolicy) -> Self {
		Self { provider, notifier: None, password, reset_second_factor: false }
	}

	/// Create a coordinator talking to Keycloak as configured.
	pub fn from_config(config: &CredentialsConfig) -> Result<Self, CredentialError> {
		let mut coordinator =
			Self::new(Arc::new(KeycloakClient::new(config.clone())?), config.password.clone());
		coordinator.reset_second_factor = config.reset_second_factor;
		Ok(coordinator)
	}

	/// Deliver welcome messages through the notifier.
	#[must_use]
	pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
		self.notifier = Some(notifier);
		self
	}

	/// Also force second factor enrollment when welcoming users.
	#[must_use]
	pub fn with_second_factor_reset(mut self, reset: bool) -> Self {
		self.reset_second_factor = reset;
		self
	}

	/// Disable the user's account. Users unknown to the provider are ignored.
	pub async fn disable(&self, user: &User) -> Result<(), CredentialError> {
		match self.provider.find_account(&user.email).await? {
			Some(account) => self.set_enabled(account, false).await,
			None => {
				debug!("{} has no provider account, nothing to disable", user.username);
				Ok(())
			}
		}
	}

	/// Enable the user's account.
	pub async fn enable(&self, user: &User) -> Result<(), CredentialError> {
		let account = self
			.provider
			.find_account(&user.email)
			.await?
			.ok_or_else(|| CredentialError::UnknownAccount(user.email.clone()))?;
		self.set_enabled(account, true).await
	}

	async fn set_enabled(
		&self,
		mut account: Account,
		enabled: bool,
	) -> Result<(), CredentialError> {
		if account.enabled == enabled {
			return Ok(());
		}
		account.enabled = enabled;
		self.provider.update_account(&account).await
	}

	/// Set a temporary password for each user and send it to them. The
	/// provider first re-reads the directory so freshly created accounts are
	/// known to it.
	pub async fn welcome(&self, users: &[&User]) -> Vec<CredentialFailure> {
		if users.is_empty() {
			return Vec::new();
		}
		if let Err(err) = self.provider.full_sync().await {
			warn!("Full sync at the credential provider failed: {err}");
			return users
				.iter()
				.map(|user| CredentialFailure {
					username: user.username.clone(),
					error: CredentialError::Connectivity(err.to_string()),
				})
				.collect();
		}
		let mut failures = Vec::new();
		for user in users {
			if let Err(error) = self.welcome_one(user).await {
				warn!("Welcoming {} failed: {error}", user.username);
				failures.push(CredentialFailure { username: user.username.clone(), error });
			}
		}
		failures
	}

	async fn welcome_one(&self, user: &User) -> Result<(), CredentialError> {
		let mut account = self
			.provider
			.find_account(&user.email)
			.await?
			.ok_or_else(|| CredentialError::UnknownAccount(user.email.clone()))?;
		let password = self.password.generate();
		self.provider.reset_password(&account.id, &password, true).await?;

		let mut actions = vec![RequiredAction::UpdatePassword];
		if self.reset_second_factor {
			actions.push(RequiredAction::ConfigureTotp);
		}
		for action in actions {
			if !account.required_actions.contains(&action) {
				account.required_actions.push(action);
			}
		}
		self.provider.update_account(&account).await?;

		match &self.notifier {
			Some(notifier) => notifier.welcome(user, &password).await,
			None => {
				debug!("No notifier configured, {} was not sent a welcome message", user.username);
				Ok(())
			}
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{
		collections::BTreeMap,
		sync::{Arc, Mutex},
	};

	use async_trait::async_trait;
	use rand::{rngs::StdRng, SeedableRng};

	use super::{
		Account, CharClass, CredentialCoordinator, CredentialError, CredentialProvider, Notifier,
		PasswordPolicy, RequiredAction,
	};
	use crate::model::{User, UserStatus};

	/// Provider double recording every write
	#[derive(Default)]
	pub(crate) struct FakeProvider {
		pub(crate) accounts: Mutex<BTreeMap<String, Account>>,
		pub(crate) calls: Mutex<Vec<String>>,
		pub(crate) fail_sync: bool,
	}

	impl FakeProvider {
		pub(crate) fn with_account(self, email: &str, enabled: bool) -> Self {
			let account = Account {
				id: format!("id-{email}"),
				username: email.to_owned(),
				email: Some(email.to_owned()),
				enabled,
				required_actions: Vec::new(),
				other: serde_json::Map::new(),
			};
			self.accounts.lock().unwrap().insert(email.to_owned(), account);
			self
		}

		pub(crate) fn with_required_action(self, email: &str, action: RequiredAction) -> Self {
			if let Some(account) = self.accounts.lock().unwrap().get_mut(email) {
				account.required_actions.push(action);
			}
			self
		}

		pub(crate) fn calls(&self) -> Vec<String> {
			self.calls.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl CredentialProvider for FakeProvider {
		async fn full_sync(&self) -> Result<(), CredentialError> {
			self.calls.lock().unwrap().push("sync".to_owned());
			if self.fail_sync {
				return Err(CredentialError::RateLimited);
			}
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
			let email = account.email.clone().unwrap();
			self.accounts.lock().unwrap().insert(email, account.clone());
			Ok(())
		}
	}

	#[derive(Default)]
	struct Outbox(Mutex<Vec<(String, String)>>);

	#[async_trait]
	impl Notifier for Outbox {
		async fn welcome(&self, user: &User, password: &str) -> Result<(), CredentialError> {
			self.0.lock().unwrap().push((user.username.clone(), password.to_owned()));
			Ok(())
		}
	}

	fn user(username: &str) -> User {
		let email = format!("{username}@example.org");
		let mut user = User::new(1, username, "Ada", "Lovelace", &email);
		user.status = UserStatus::Active;
		user
	}

	#[test]
	fn passwords_cycle_through_classes() {
		let policy = PasswordPolicy::default();
		let password = policy.generate_with(&mut StdRng::seed_from_u64(7));
		assert_eq!(password.len(), 12);
		for (i, c) in password.bytes().enumerate() {
			assert!(CharClass::ALL[i % 4].charset().contains(&c), "{password} at {i}");
		}

		let digits = PasswordPolicy { length: 5, classes: vec![CharClass::Digit] };
		assert!(digits.generate().bytes().all(|c| c.is_ascii_digit()));
		assert!(!CharClass::Upper.charset().contains(&b'O'));
		assert!(!CharClass::Lower.charset().contains(&b'l'));
	}

	#[tokio::test]
	async fn enable_and_disable_only_write_changes() -> Result<(), Box<dyn std::error::Error>> {
		let provider = Arc::new(FakeProvider::default().with_account("ada@example.org", true));
		let coordinator = CredentialCoordinator::new(provider.clone(), PasswordPolicy::default());
		let ada = user("ada");

		coordinator.enable(&ada).await?;
		assert!(provider.calls().is_empty(), "Already enabled");
		coordinator.disable(&ada).await?;
		coordinator.disable(&ada).await?;
		assert_eq!(provider.calls(), ["update id-ada@example.org false"]);

		coordinator.disable(&user("ghost")).await?;
		assert!(matches!(
			coordinator.enable(&user("ghost")).await,
			Err(CredentialError::UnknownAccount(_))
		));
		Ok(())
	}

	#[tokio::test]
	async fn welcome_sets_temporary_password_and_actions() {
		let provider = Arc::new(FakeProvider::default().with_account("ada@example.org", true));
		let outbox = Arc::new(Outbox::default());
		let coordinator = CredentialCoordinator::new(provider.clone(), PasswordPolicy::default())
			.with_notifier(outbox.clone())
			.with_second_factor_reset(true);

		let ada = user("ada");
		let ghost = user("ghost");
		let failures = coordinator.welcome(&[&ada, &ghost]).await;

		assert_eq!(failures.len(), 1);
		assert_eq!(failures[0].username, "ghost");
		assert_eq!(
			provider.calls(),
			["sync", "reset id-ada@example.org true", "update id-ada@example.org true"]
		);
		let account = provider.accounts.lock().unwrap()["ada@example.org"].clone();
		assert_eq!(
			account.required_actions,
			[RequiredAction::UpdatePassword, RequiredAction::ConfigureTotp]
		);
		let sent = outbox.0.lock().unwrap();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].1.len(), 12);
	}

	#[tokio::test]
	async fn welcome_keeps_pending_actions() {
		let verify = RequiredAction::Other("VERIFY_EMAIL".into());
		let provider = Arc::new(
			FakeProvider::default()
				.with_account("ada@example.org", true)
				.with_required_action("ada@example.org", verify.clone())
				.with_required_action("ada@example.org", RequiredAction::UpdatePassword),
		);
		let coordinator = CredentialCoordinator::new(provider.clone(), PasswordPolicy::default());
		assert!(coordinator.welcome(&[&user("ada")]).await.is_empty());

		let account = provider.accounts.lock().unwrap()["ada@example.org"].clone();
		assert_eq!(account.required_actions, [verify, RequiredAction::UpdatePassword]);
	}

	#[tokio::test]
	async fn failed_sync_fails_every_user() {
		let provider = Arc::new(FakeProvider { fail_sync: true, ..FakeProvider::default() });
		let coordinator = CredentialCoordinator::new(provider.clone(), PasswordPolicy::default());
		let (ada, bob) = (user("ada"), user("bob"));
		assert_eq!(coordinator.welcome(&[&ada, &bob]).await.len(), 2);
		assert_eq!(provider.calls(), ["sync"]);
	}

	#[test]
	fn account_keeps_unknown_fields() -> Result<(), serde_json::Error> {
		let account: Account = serde_json::from_str(
			r#"{"id":"1","username":"ada","email":"ada@example.org","enabled":true,
			"requiredActions":["CONFIGURE_TOTP"],"firstName":"Ada"}"#,
		)?;
		assert_eq!(account.required_actions, [RequiredAction::ConfigureTotp]);
		let json = serde_json::to_value(&account)?;
		assert_eq!(json["firstName"], "Ada");
		assert_eq!(json["requiredActions"][0], "CONFIGURE_TOTP");
		Ok(())
	}

	#[test]
	fn accounts_with_other_actions_decode() -> Result<(), serde_json::Error> {
		let accounts: Vec<Account> = serde_json::from_str(
			r#"[{"id":"1","username":"ada","email":"ada@example.org","enabled":true,
			"requiredActions":["VERIFY_EMAIL","UPDATE_PASSWORD","TERMS_AND_CONDITIONS"]}]"#,
		)?;
		assert_eq!(
			accounts[0].required_actions,
			[
				RequiredAction::Other("VERIFY_EMAIL".into()),
				RequiredAction::UpdatePassword,
				RequiredAction::Other("TERMS_AND_CONDITIONS".into()),
			]
		);
		let json = serde_json::to_value(&accounts[0])?;
		assert_eq!(json["requiredActions"][0], "VERIFY_EMAIL");
		assert_eq!(json["requiredActions"][2], "TERMS_AND_CONDITIONS");
		Ok(())
	}
}
