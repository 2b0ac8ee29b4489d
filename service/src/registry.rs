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

//! Scheme to connector registry
//!
//! The registry is built once at startup and is immutable afterwards;
//! components that open outbound sessions receive it by `Arc`.
//!
//! ```
//! use relaygate_service::{IoWorkerPool, PipeAcceptor, TransportRegistry, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let workers = Arc::new(IoWorkerPool::new(&WorkerPoolConfig::new(1)).unwrap());
//! let pipes = PipeAcceptor::new(workers);
//! let registry = TransportRegistry::builder()
//!     .with_connector(Arc::new(pipes.connector()))
//!     .build();
//! assert!(registry.connector("pipe").is_some());
//! ```

use crate::{
    ConnectFuture, Connector, IoHandler, ResourceAddress, SessionError, SessionInitializer,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Immutable map from scheme to connector
#[derive(Clone, Default)]
pub struct TransportRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl TransportRegistry {
    /// Start building a registry
    pub fn builder() -> TransportRegistryBuilder {
        TransportRegistryBuilder::default()
    }

    /// Get the connector for `scheme`
    pub fn connector(&self, scheme: &str) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Connect to `address` with the connector registered for its scheme
    pub fn connect(
        &self,
        address: &ResourceAddress,
        handler: Arc<dyn IoHandler>,
        initializer: Option<SessionInitializer>,
    ) -> ConnectFuture {
        match self.connector(address.scheme()) {
            Some(connector) => connector.connect(address, handler, initializer),
            None => ConnectFuture::completed(Err(SessionError::UnknownScheme(
                address.scheme().to_string(),
            ))),
        }
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

/// Builder for [`TransportRegistry`]
#[derive(Default)]
pub struct TransportRegistryBuilder {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl TransportRegistryBuilder {
    /// Register `connector` under its own scheme
    ///
    /// A later registration for the same scheme replaces the earlier one.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        let scheme = connector.scheme().to_ascii_lowercase();
        if self.connectors.insert(scheme.clone(), connector).is_some() {
            tracing::warn!(scheme = %scheme, "Replacing registered connector");
        }
        self
    }

    /// Freeze the registry
    pub fn build(self) -> TransportRegistry {
        TransportRegistry {
            connectors: self.connectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct NamedConnector(&'static str);

    impl Connector for NamedConnector {
        fn scheme(&self) -> &str {
            self.0
        }

        fn connect(
            &self,
            address: &ResourceAddress,
            _handler: Arc<dyn IoHandler>,
            _initializer: Option<SessionInitializer>,
        ) -> ConnectFuture {
            ConnectFuture::completed(Err(SessionError::Connect {
                address: address.to_string(),
                reason: "refused".into(),
            }))
        }
    }

    struct NoopHandler;
    impl IoHandler for NoopHandler {}

    #[test]
    fn test_registry_dispatches_by_scheme() {
        let registry = TransportRegistry::builder()
            .with_connector(Arc::new(NamedConnector("tcp")))
            .with_connector(Arc::new(NamedConnector("WS")))
            .build();
        assert_eq!(registry.schemes(), vec!["tcp", "ws"]);
        assert!(registry.connector("Ws").is_some());

        let result = registry
            .connect(&"tcp://localhost:1".parse().unwrap(), Arc::new(NoopHandler), None)
            .get()
            .unwrap();
        assert!(matches!(result, Err(SessionError::Connect { .. })));
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = TransportRegistry::builder().build();
        let result = registry
            .connect(&ResourceAddress::new("udp", "x:1"), Arc::new(NoopHandler), None)
            .get()
            .unwrap();
        assert!(matches!(result, Err(SessionError::UnknownScheme(ref s)) if s == "udp"));
    }

    #[test]
    #[traced_test]
    fn test_later_registration_replaces_scheme() {
        let registry = TransportRegistry::builder()
            .with_connector(Arc::new(NamedConnector("pipe")))
            .with_connector(Arc::new(NamedConnector("PIPE")))
            .build();
        assert_eq!(registry.schemes(), vec!["pipe"]);
        assert!(logs_contain("Replacing registered connector"));
    }
}
