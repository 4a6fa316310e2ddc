//! Login gate: Argon2 password hashes in the store, opaque bearer tokens in
//! memory. Tokens do not survive a restart.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use log::{debug, info, warn};
use uuid::Uuid;
use warp::{Filter, Rejection};

use crate::error_handling::types::AuthError;
use crate::storage::types::{NewUser, User, UserId};
use crate::storage::Storage;

/// Cookie carrying the login token.
pub const SESSION_COOKIE: &str = "multiwa_sid";

/// Rejection raised by [`with_user`] for anonymous requests.
#[derive(Debug)]
pub struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

#[derive(Default)]
pub struct AuthGate {
    tokens: RwLock<HashMap<String, UserId>>,
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|e| AuthError::HashingFailed(e.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::HashingFailed(e.to_string()))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is unreadable: {}", e);
            false
        }
    }
}

impl AuthGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&self, user_id: UserId) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), user_id);
        token
    }

    /// Creates the account and logs it in.
    pub fn register(
        &self,
        storage: &dyn Storage,
        username: &str,
        password: &str,
    ) -> Result<(User, String), AuthError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingFields);
        }
        if storage.get_user_by_username(username)?.is_some() {
            return Err(AuthError::UsernameTaken);
        }

        let user = storage.create_user(NewUser {
            username: username.to_string(),
            password: hash_password(password)?,
        })?;
        info!("Registered user {} ({})", user.username, user.id);
        let token = self.issue(user.id);
        Ok((user, token))
    }

    pub fn login(
        &self,
        storage: &dyn Storage,
        username: &str,
        password: &str,
    ) -> Result<(User, String), AuthError> {
        let user = storage
            .get_user_by_username(username.trim())?
            .filter(|u| verify_password(password, &u.password))
            .ok_or_else(|| {
                warn!("Failed login attempt for '{}'", username);
                AuthError::InvalidCredentials
            })?;
        debug!("User {} logged in", user.id);
        let token = self.issue(user.id);
        Ok((user, token))
    }

    pub fn logout(&self, token: &str) {
        if let Some(user_id) = self
            .tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
        {
            debug!("User {} logged out", user_id);
        }
    }

    pub fn user_for(&self, token: &str) -> Option<UserId> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .copied()
    }
}

/// `Set-Cookie` value for a fresh login token.
pub fn session_cookie(token: &str) -> String {
    format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, token)
}

pub fn expired_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; Max-Age=0", SESSION_COOKIE)
}

/// Extracts the presented token from the cookie or an `Authorization:
/// Bearer` header.
pub fn with_token() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE)
        .and(warp::header::optional::<String>("authorization"))
        .map(|cookie: Option<String>, header: Option<String>| {
            cookie.or_else(|| {
                header.and_then(|h| h.strip_prefix("Bearer ").map(|t| t.trim().to_string()))
            })
        })
}

/// Resolves the calling user or rejects with [`Unauthorized`].
pub fn with_user(auth: Arc<AuthGate>) -> impl Filter<Extract = (UserId,), Error = Rejection> + Clone {
    with_token().and_then(move |token: Option<String>| {
        let auth = auth.clone();
        async move {
            token
                .and_then(|t| auth.user_for(&t))
                .ok_or_else(|| warp::reject::custom(Unauthorized))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;
    use tempfile::TempDir;

    #[test]
    fn hashes_verify_and_differ() {
        let first = hash_password("s3cret").unwrap();
        let second = hash_password("s3cret").unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("$argon2"));
        assert!(verify_password("s3cret", &first));
        assert!(!verify_password("wrong", &first));
        assert!(!verify_password("s3cret", "not a hash"));
    }

    #[test]
    fn register_login_logout() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let gate = AuthGate::new();

        let (user, token) = gate.register(&storage, "alice", "pw").unwrap();
        assert_ne!(user.password, "pw");
        assert_eq!(gate.user_for(&token), Some(user.id));
        assert_eq!(
            gate.register(&storage, "alice", "other").unwrap_err(),
            AuthError::UsernameTaken
        );
        assert_eq!(
            gate.register(&storage, " ", "pw").unwrap_err(),
            AuthError::MissingFields
        );

        assert_eq!(
            gate.login(&storage, "alice", "nope").unwrap_err(),
            AuthError::InvalidCredentials
        );
        let (_, second) = gate.login(&storage, "alice", "pw").unwrap();
        gate.logout(&token);
        assert_eq!(gate.user_for(&token), None);
        assert_eq!(gate.user_for(&second), Some(user.id));
    }

    #[tokio::test]
    async fn token_from_cookie_or_bearer() {
        let gate = Arc::new(AuthGate::new());
        let token = gate.issue(9);
        let filter = with_user(gate);

        let by_cookie = warp::test::request()
            .header("cookie", format!("{}={}", SESSION_COOKIE, token))
            .filter(&filter)
            .await
            .unwrap();
        let by_header = warp::test::request()
            .header("authorization", format!("Bearer {}", token))
            .filter(&filter)
            .await
            .unwrap();
        assert_eq!((by_cookie, by_header), (9, 9));

        let anonymous = warp::test::request().filter(&with_token()).await.unwrap();
        assert_eq!(anonymous, None);
        let other_scheme = warp::test::request()
            .header("authorization", "Basic abc")
            .filter(&with_token())
            .await
            .unwrap();
        assert_eq!(other_scheme, None);
        assert!(warp::test::request().filter(&filter).await.is_err());
    }
}
