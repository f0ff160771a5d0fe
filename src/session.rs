#![forbid(unsafe_code)]

//! Admin session gate.
//!
//! This is a demo-grade gate, not an authentication system: credentials are
//! compared against configured plain text and the session is a base64
//! encoded JSON blob with no signature. Anyone able to write the storage can
//! forge a session. Its only contract is presence plus an expiry check.

use std::{fmt, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, CatalogResult};
use crate::storage::KeyValueStorage;

pub const SESSION_KEY: &str = "adminSession";
pub const LAST_LOGIN_KEY: &str = "lastLogin";

pub const SESSION_TTL_HOURS: i64 = 24;
pub const REMEMBERED_SESSION_TTL_DAYS: i64 = 30;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub username: String,
    #[serde(rename = "loginTime", alias = "issuedAt")]
    pub issued_at: i64,
    #[serde(rename = "expiry", alias = "expiresAt")]
    pub expires_at: i64,
    #[serde(rename = "rememberMe", default)]
    pub remember_me: bool,
}

impl Session {
    pub fn issue(username: &str, remember_me: bool, now_ms: i64) -> Self {
        let ttl = if remember_me {
            Duration::days(REMEMBERED_SESSION_TTL_DAYS)
        } else {
            Duration::hours(SESSION_TTL_HOURS)
        };
        Self {
            username: username.to_string(),
            issued_at: now_ms,
            expires_at: now_ms + ttl.num_milliseconds(),
            remember_me,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    /// The form stored under [`SESSION_KEY`] and sent in the admin header.
    pub fn token(&self) -> CatalogResult<String> {
        let raw = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(raw))
    }

    pub fn from_token(token: &str) -> CatalogResult<Self> {
        let raw = STANDARD
            .decode(token.trim())
            .map_err(|_| CatalogError::Auth("malformed session token".into()))?;
        serde_json::from_slice(&raw)
            .map_err(|_| CatalogError::Auth("malformed session token".into()))
    }
}

pub struct SessionGate {
    storage: Arc<dyn KeyValueStorage>,
    credentials: Credentials,
}

impl SessionGate {
    pub fn new(storage: Arc<dyn KeyValueStorage>, credentials: Credentials) -> Self {
        Self {
            storage,
            credentials,
        }
    }

    pub fn login(&self, username: &str, password: &str, remember_me: bool) -> CatalogResult<Session> {
        self.login_at(username, password, remember_me, Utc::now().timestamp_millis())
    }

    /// Checks the credentials and stores a fresh session issued at `now_ms`.
    pub fn login_at(
        &self,
        username: &str,
        password: &str,
        remember_me: bool,
        now_ms: i64,
    ) -> CatalogResult<Session> {
        if username.trim() != self.credentials.username || password != self.credentials.password {
            log::warn!("rejected admin login for {username:?}");
            return Err(CatalogError::Auth("invalid username or password".into()));
        }
        let session = Session::issue(&self.credentials.username, remember_me, now_ms);
        self.storage
            .set(SESSION_KEY, &session.token()?)
            .map_err(CatalogError::persistence)?;
        if let Err(err) = self.storage.set(LAST_LOGIN_KEY, &Utc::now().to_rfc3339()) {
            log::warn!("could not record last login: {err:#}");
        }
        log::info!("admin {} logged in", session.username);
        Ok(session)
    }

    pub fn is_valid(&self, session: &Session) -> bool {
        self.is_valid_at(session, Utc::now().timestamp_millis())
    }

    /// Valid means issued for the configured admin and not yet expired. An
    /// expired session is invalid regardless of its username.
    pub fn is_valid_at(&self, session: &Session, now_ms: i64) -> bool {
        !session.is_expired_at(now_ms) && session.username == self.credentials.username
    }

    /// The stored session, when present and valid.
    pub fn current(&self) -> Option<Session> {
        let raw = match self.storage.get(SESSION_KEY) {
            Ok(raw) => raw?,
            Err(err) => {
                log::warn!("could not read {SESSION_KEY}: {err:#}");
                return None;
            }
        };
        let session = Session::from_token(&raw).ok()?;
        self.is_valid(&session).then_some(session)
    }

    pub fn logout(&self) -> CatalogResult<()> {
        self.storage
            .remove(SESSION_KEY)
            .map_err(CatalogError::persistence)?;
        log::info!("admin logged out");
        Ok(())
    }

    /// Accepts `token` only when it is the currently stored, valid session,
    /// so a logout revokes previously handed out tokens.
    pub fn authorize(&self, token: &str) -> CatalogResult<Session> {
        let presented = Session::from_token(token)?;
        if !self.is_valid(&presented) {
            return Err(CatalogError::Auth("session expired".into()));
        }
        match self.current() {
            Some(stored) if stored == presented => Ok(presented),
            _ => Err(CatalogError::Auth("session is not active".into())),
        }
    }

    pub fn last_login(&self) -> Option<String> {
        self.storage.get(LAST_LOGIN_KEY).ok().flatten()
    }
}
