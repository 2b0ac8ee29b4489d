//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Outbound connection establishment

use crate::{ConnectFuture, IoHandler, Result, Session, SessionError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Callback run on a new session before it is considered connected
///
/// Initializers install filters and attributes; nothing can arrive on the
/// session until they return. An error aborts the connect and closes the
/// session.
pub type SessionInitializer = Arc<dyn Fn(&Arc<Session>) -> Result<()> + Send + Sync + 'static>;

/// A `scheme://authority` resource address
///
/// Only the split into scheme and authority is interpreted here; what the
/// authority means is up to the connector registered for the scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceAddress {
    scheme: String,
    authority: String,
}

impl ResourceAddress {
    /// Create an address from its parts
    pub fn new(scheme: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            authority: authority.into(),
        }
    }

    /// The scheme, lower-cased
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything after `://`
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl FromStr for ResourceAddress {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, authority) = s
            .split_once("://")
            .ok_or_else(|| SessionError::InvalidAddress(s.to_string()))?;
        let valid_scheme = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme || authority.is_empty() {
            return Err(SessionError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(scheme, authority))
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Establishes outbound sessions for one scheme
pub trait Connector: Send + Sync + 'static {
    /// The scheme this connector serves
    fn scheme(&self) -> &str;

    /// Start connecting to `address`
    ///
    /// The returned future resolves with the new session once the transport
    /// is up, `initializer` has run and `session_opened` has been fired, or
    /// with the reason the attempt failed. Connectors never retry.
    fn connect(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<SessionInitializer>,
    ) -> ConnectFuture;
}

/// Run `initializer` on a freshly built session
///
/// On failure the session is closed and the error returned.
pub fn run_initializer(session: &Arc<Session>, initializer: Option<&SessionInitializer>) -> Result<()> {
    let Some(initializer) = initializer else {
        return Ok(());
    };
    if let Err(error) = initializer(session) {
        tracing::warn!(session_id = %session.id(), error = %error, "Session initializer failed");
        session.close_now();
        return Err(error);
    }
    Ok(())
}
