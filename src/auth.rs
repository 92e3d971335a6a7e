use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

use crate::config::Config;

/// Service password every pgwire client presents at startup.
///
/// This only gates the transport. Holder ids arrive as plain values inside
/// each statement and are never checked against the login user.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    password: Arc<[u8]>,
}

impl ServiceCredentials {
    pub fn new(password: impl AsRef<str>) -> Self {
        Self {
            password: Arc::from(password.as_ref().as_bytes()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.password)
    }
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServiceCredentials(..)")
    }
}

#[async_trait]
impl AuthSource for ServiceCredentials {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(
            "password login from {} as {}",
            login.host(),
            login.user().unwrap_or("<none>")
        );
        Ok(Password::new(None, self.password.to_vec()))
    }
}
