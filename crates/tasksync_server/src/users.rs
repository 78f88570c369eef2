//! Accounts.
//!
//! Passwords are stored as Argon2id PHC strings. Hashing and verification are
//! deliberately slow; handlers run them on the blocking pool.

use crate::error::{ServerError, ServerResult};
use crate::hub::UserId;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tasksync_protocol::{Login, Registration, User};

/// Minimum password length accepted at registration.
pub const MIN_PASSWORD_LEN: usize = 8;

struct Account {
    user: User,
    password_hash: String,
}

/// Registered accounts, keyed by normalized email.
pub struct UserStore {
    accounts: RwLock<HashMap<String, Account>>,
    next_id: AtomicI64,
}

impl UserStore {
    /// Creates an empty store. Ids start at 1.
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Creates an account.
    pub fn register(&self, request: &Registration) -> ServerResult<User> {
        let email = normalize(&request.email);
        if email.is_empty() {
            return Err(ServerError::InvalidRequest("email is required".into()));
        }
        if request.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ServerError::InvalidRequest(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        if self.accounts.read().contains_key(&email) {
            return Err(ServerError::Conflict("email already registered".into()));
        }

        // Hash outside the lock; the insert below rechecks the email.
        let password_hash = hash_password(&request.password)?;

        let mut accounts = self.accounts.write();
        if accounts.contains_key(&email) {
            return Err(ServerError::Conflict("email already registered".into()));
        }
        let user = User {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            email: email.clone(),
            display_name: request.display_name.trim().to_string(),
            created_at: Utc::now(),
        };
        accounts.insert(
            email,
            Account {
                user: user.clone(),
                password_hash,
            },
        );
        tracing::debug!(user = user.id, "account created");
        Ok(user)
    }

    /// Checks a login. Unknown emails and wrong passwords fail alike.
    pub fn authenticate(&self, login: &Login) -> ServerResult<User> {
        let email = normalize(&login.email);
        let (user, password_hash) = {
            let accounts = self.accounts.read();
            let account = accounts.get(&email).ok_or_else(invalid_credentials)?;
            (account.user.clone(), account.password_hash.clone())
        };
        if !verify_password(&login.password, &password_hash)? {
            return Err(invalid_credentials());
        }
        Ok(user)
    }

    /// Returns an account by id.
    pub fn get(&self, id: UserId) -> ServerResult<User> {
        self.accounts
            .read()
            .values()
            .find(|account| account.user.id == id)
            .map(|account| account.user.clone())
            .ok_or_else(|| ServerError::NotFound("user".into()))
    }

    /// Returns the number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    /// Returns true if no account exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

fn invalid_credentials() -> ServerError {
    ServerError::AuthenticationFailed("invalid credentials".into())
}

fn hash_password(password: &str) -> ServerResult<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ServerError::Internal(format!("password hashing: {e}")))
}

fn verify_password(password: &str, password_hash: &str) -> ServerResult<bool> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|e| ServerError::Internal(format!("stored password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(email: &str, password: &str) -> Registration {
        Registration {
            email: email.into(),
            password: password.into(),
            display_name: String::new(),
        }
    }

    fn login(email: &str, password: &str) -> Login {
        Login {
            email: email.into(),
            password: password.into(),
        }
    }

    #[test]
    fn register_then_authenticate() {
        let users = UserStore::new();
        let user = users
            .register(&registration(" Ada@Example.com ", "correct horse"))
            .unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(users.get(user.id).unwrap(), user);

        let again = users
            .authenticate(&login("ADA@example.com", "correct horse"))
            .unwrap();
        assert_eq!(again.id, user.id);
    }

    #[test]
    fn wrong_password_and_unknown_email_look_the_same() {
        let users = UserStore::new();
        users
            .register(&registration("ada@example.com", "correct horse"))
            .unwrap();

        let wrong = users.authenticate(&login("ada@example.com", "battery staple"));
        let unknown = users.authenticate(&login("bob@example.com", "correct horse"));
        match (wrong, unknown) {
            (
                Err(ServerError::AuthenticationFailed(a)),
                Err(ServerError::AuthenticationFailed(b)),
            ) => assert_eq!(a, b),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn registration_is_validated() {
        let users = UserStore::new();
        assert!(matches!(
            users.register(&registration("", "long enough")),
            Err(ServerError::InvalidRequest(_))
        ));
        assert!(matches!(
            users.register(&registration("ada@example.com", "short")),
            Err(ServerError::InvalidRequest(_))
        ));

        users
            .register(&registration("ada@example.com", "long enough"))
            .unwrap();
        assert!(matches!(
            users.register(&registration("ADA@example.com", "other password")),
            Err(ServerError::Conflict(_))
        ));
        assert_eq!(users.len(), 1);
    }
}
