//! Appliance session tokens.
//!
//! Every REST call carries an `X-Auth-Session` header obtained by POSTing the
//! user's credentials to the appliance access service. Tokens are cached per
//! username; a three-state lifecycle (`Invalid → Creating → Valid`) behind a
//! mutex and a condition variable guarantees that concurrent requests
//! coalesce on a single creation POST, and that a 401-driven renewal happens
//! at most once per rotation.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::CsiError;

enum TokenState {
    Invalid,
    Creating,
    Valid { session: String, name: String },
}

/// A per-username session record.
pub struct Token {
    appliance: String,
    user: String,
    password: String,
    state: Mutex<TokenState>,
    cv: Notify,
}

impl Token {
    fn new(appliance: &str, user: &str, password: &str) -> Self {
        Self {
            appliance: appliance.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
            state: Mutex::new(TokenState::Invalid),
            cv: Notify::new(),
        }
    }

    /// Appliance this token authenticates against.
    pub fn appliance(&self) -> &str {
        &self.appliance
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns a valid session cookie, creating one if necessary.
    ///
    /// `previous` is the session a caller observed when the appliance
    /// answered 401; the token is renewed only if that session is still the
    /// live one, so concurrent 401s trigger a single POST. While one task is
    /// creating, all others wait on the condition variable and then re-read
    /// the state.
    pub async fn session(
        &self,
        http: &reqwest::Client,
        access_url: &str,
        previous: Option<&str>,
    ) -> Result<String, CsiError> {
        enum Step<'a> {
            Create,
            Wait(std::pin::Pin<Box<tokio::sync::futures::Notified<'a>>>),
            Return(String),
        }

        loop {
            let step = {
                let mut state = self.state.lock();
                match &*state {
                    TokenState::Invalid => {
                        *state = TokenState::Creating;
                        Step::Create
                    }
                    TokenState::Creating => {
                        // Another task is creating; register for the wake-up
                        // before releasing the lock so the notification cannot
                        // be missed.
                        let mut notified = Box::pin(self.cv.notified());
                        notified.as_mut().enable();
                        Step::Wait(notified)
                    }
                    TokenState::Valid { session, .. } => {
                        let stale = previous.is_some_and(|p| p == session.as_str());
                        if stale {
                            // The caller's 401 was for the live session; rotate it.
                            *state = TokenState::Invalid;
                            continue;
                        }
                        Step::Return(session.clone())
                    }
                }
            };

            match step {
                Step::Return(session) => return Ok(session),
                Step::Wait(notified) => {
                    notified.await;
                }
                Step::Create => {
                    let created =
                        create_session(http, access_url, &self.user, &self.password).await;

                    let mut state = self.state.lock();
                    match created {
                        Ok((session, name)) => {
                            debug!(user = %self.user, "appliance session created");
                            *state = TokenState::Valid {
                                session: session.clone(),
                                name,
                            };
                            drop(state);
                            self.cv.notify_waiters();
                            return Ok(session);
                        }
                        Err(e) => {
                            warn!(user = %self.user, error = %e, "appliance session creation failed");
                            *state = TokenState::Invalid;
                            drop(state);
                            self.cv.notify_waiters();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

/// POST to the access service, expecting 201 and the session headers.
async fn create_session(
    http: &reqwest::Client,
    access_url: &str,
    user: &str,
    password: &str,
) -> Result<(String, String), CsiError> {
    let rsp = http
        .post(access_url)
        .header("X-Auth-User", user)
        .header("X-Auth-Key", password)
        .body(Vec::new())
        .send()
        .await
        .map_err(|e| CsiError::Internal(format!("failure creating token: {e}")))?;

    if rsp.status() != StatusCode::CREATED {
        return Err(CsiError::Internal(format!(
            "failure creating token (status {})",
            rsp.status().as_u16()
        )));
    }

    let header = |name: &str| {
        rsp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    let session = header("X-Auth-Session")
        .ok_or_else(|| CsiError::Internal("token response is missing X-Auth-Session".into()))?;
    let name = header("X-Auth-Name").unwrap_or_default();
    Ok((session, name))
}

/// Per-username token cache.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: DashMap<String, Arc<Token>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the token for `user`, creating a record if none exists yet.
    pub fn lookup(&self, appliance: &str, user: &str, password: &str) -> Arc<Token> {
        self.tokens
            .entry(user.to_owned())
            .or_insert_with(|| Arc::new(Token::new(appliance, user, password)))
            .clone()
    }
}
