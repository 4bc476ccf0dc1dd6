use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::warn;

use chatdesk_core::identity::{CredentialFailure, Identity};
use chatdesk_core::ids::AccountId;
use chatdesk_store::{Account, AccountRepo, StoreError};

/// Turns an optional bearer credential into an identity.
///
/// Never fails: anything that does not verify resolves to a guest.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: Option<&str>) -> Identity;
}

const MAX_TOKEN_TTL_DAYS: i64 = 3650;

/// Signed token body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account id.
    pub sub: String,
    /// Display name at issue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Issues HS256 tokens for accounts.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    default_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &SecretString, default_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.expose_secret().as_bytes()),
            default_ttl,
        }
    }

    pub fn issue(
        &self,
        account: &Account,
        ttl: Option<Duration>,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Utc::now();
        let exp = now + chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(MAX_TOKEN_TTL_DAYS));
        self.sign(&Claims {
            sub: account.id.as_str().to_string(),
            name: Some(account.name.clone()),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
    }
}

/// Verifies HS256 tokens and looks the subject up in the account store.
pub struct JwtIdentityResolver {
    decoding_key: DecodingKey,
    validation: Validation,
    accounts: AccountRepo,
}

impl JwtIdentityResolver {
    pub fn new(secret: &SecretString, accounts: AccountRepo) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            decoding_key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
            accounts,
        }
    }

    /// Full verification, exposing why a credential was rejected.
    pub async fn verify(&self, credential: &str) -> Result<Identity, CredentialFailure> {
        let token = credential
            .strip_prefix("Bearer ")
            .unwrap_or(credential)
            .trim();
        let claims = self.decode_claims(token)?;
        let account = self.lookup(AccountId::from_raw(claims.sub)).await?;

        Ok(if account.role.is_privileged() {
            Identity::agent(account.id, account.name)
        } else {
            Identity::authenticated_guest(account.id, account.name)
        })
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, CredentialFailure> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CredentialFailure::Expired,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_)
                | ErrorKind::MissingRequiredClaim(_) => CredentialFailure::Malformed,
                _ => CredentialFailure::SignatureInvalid,
            })
    }

    async fn lookup(&self, id: AccountId) -> Result<Account, CredentialFailure> {
        let accounts = self.accounts.clone();
        let result = tokio::task::spawn_blocking(move || accounts.get(&id)).await;
        match result {
            Ok(Ok(account)) => Ok(account),
            Ok(Err(StoreError::NotFound(_))) => Err(CredentialFailure::SubjectNotFound),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "account lookup failed");
                Err(CredentialFailure::SubjectNotFound)
            }
            Err(e) => {
                tracing::error!(error = %e, "account lookup task failed");
                Err(CredentialFailure::SubjectNotFound)
            }
        }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, credential: Option<&str>) -> Identity {
        let Some(credential) = credential.filter(|c| !c.trim().is_empty()) else {
            return Identity::guest();
        };
        match self.verify(credential).await {
            Ok(identity) => identity,
            Err(failure) => {
                warn!(failure = failure.kind(), "credential rejected, continuing as guest");
                Identity::guest()
            }
        }
    }
}

/// Random signing secret for runs without a configured one.
pub fn generate_secret() -> SecretString {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();
    SecretString::from(secret)
}
