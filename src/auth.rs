//! Credential validation seam.
//!
//! The engine never checks passwords itself; it delegates to whichever
//! backend the application registered and selected at runtime. With no
//! backend configured, validation fails closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Error;

pub(crate) const NO_BACKEND: &str =
    "Required authorization backend method is not enabled or configured";

/// A credential store the engine can delegate to.
pub trait AuthBackend: Send + Sync {
    /// Validate `password` for `user` within `realm`.
    ///
    /// `required_pass`, when given, is the password the caller already
    /// resolved (digest flows); otherwise the backend consults its own
    /// store. The error string is surfaced to the application, never to
    /// the peer.
    fn validate_cred(
        &self,
        realm: &str,
        user: &str,
        password: &str,
        required_pass: Option<&str>,
    ) -> Result<(), String>;

    /// Fetch the stored password, if this backend will reveal it.
    fn get_password(&self, realm: &str, user: &str) -> Option<String>;
}

/// Runtime registry of authentication backends.
#[derive(Default)]
pub(crate) struct AuthRegistry {
    backends: HashMap<String, Arc<dyn AuthBackend>>,
    active: Option<String>,
}

impl AuthRegistry {
    pub(crate) fn register(&mut self, name: &str, backend: Arc<dyn AuthBackend>) {
        self.backends.insert(name.to_ascii_lowercase(), backend);
    }

    pub(crate) fn select(&mut self, name: &str) -> bool {
        if self.backends.contains_key(&name.to_ascii_lowercase()) {
            self.active = Some(name.to_ascii_lowercase());
            true
        } else {
            false
        }
    }

    fn active(&self) -> Option<&Arc<dyn AuthBackend>> {
        self.active.as_ref().and_then(|name| self.backends.get(name))
    }

    pub(crate) fn validate_cred(
        &self,
        realm: &str,
        user: &str,
        password: &str,
        required_pass: Option<&str>,
    ) -> Result<(), Error> {
        match self.active() {
            Some(backend) => backend
                .validate_cred(realm, user, password, required_pass)
                .map_err(|msg| Error::new_auth_required().with(msg)),
            None => Err(Error::new_auth_required().with(NO_BACKEND)),
        }
    }

    pub(crate) fn get_password(&self, realm: &str, user: &str) -> Option<String> {
        self.active().and_then(|backend| backend.get_password(realm, user))
    }
}

/// In-memory backend configured by the application.
#[derive(Default)]
pub struct ConfigBackend {
    users: Mutex<HashMap<(String, String), String>>,
}

impl ConfigBackend {
    /// An empty store.
    pub fn new() -> ConfigBackend {
        ConfigBackend::default()
    }

    /// Record a user's password within a realm.
    pub fn add_user(&self, realm: &str, user: &str, password: &str) {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((realm.to_string(), user.to_string()), password.to_string());
    }
}

impl AuthBackend for ConfigBackend {
    fn validate_cred(
        &self,
        realm: &str,
        user: &str,
        password: &str,
        required_pass: Option<&str>,
    ) -> Result<(), String> {
        let expected = match required_pass {
            Some(pass) => Some(pass.to_string()),
            None => self.get_password(realm, user),
        };
        match expected {
            Some(expected) if expected == password => Ok(()),
            Some(_) => Err("Access denied, authentication error".to_string()),
            None => Err(format!("Access denied, unknown user \"{}\"", user)),
        }
    }

    fn get_password(&self, realm: &str, user: &str) -> Option<String> {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(realm.to_string(), user.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backend_fails_closed() {
        let registry = AuthRegistry::default();
        let err = registry
            .validate_cred("realm", "ace", "secret", None)
            .unwrap_err();
        assert!(err.is_auth_required());
        assert!(err.to_string().contains(NO_BACKEND));
    }

    #[test]
    fn config_backend_round_trip() {
        let backend = ConfigBackend::new();
        backend.add_user("realm", "ace", "secret");

        let mut registry = AuthRegistry::default();
        registry.register("config", Arc::new(backend));
        assert!(registry.select("config"));

        assert!(registry.validate_cred("realm", "ace", "secret", None).is_ok());
        assert!(registry
            .validate_cred("realm", "ace", "wrong", None)
            .is_err());
        assert!(registry
            .validate_cred("realm", "nobody", "secret", None)
            .is_err());
        assert_eq!(
            registry.get_password("realm", "ace").as_deref(),
            Some("secret")
        );
    }

    #[test]
    fn required_pass_overrides_store() {
        let backend = ConfigBackend::new();
        assert!(backend
            .validate_cred("realm", "ace", "token", Some("token"))
            .is_ok());
        assert!(backend
            .validate_cred("realm", "ace", "token", Some("other"))
            .is_err());
    }

    #[test]
    fn selecting_unknown_backend_fails() {
        let mut registry = AuthRegistry::default();
        assert!(!registry.select("pam"));
    }
}
