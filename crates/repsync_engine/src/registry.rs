//! Explicit transport registry.
//!
//! Transports are registered at process start in a factory table keyed
//! by URL scheme with an explicit priority; the registry is passed to
//! whoever opens connections. There is no runtime discovery and no
//! global state.

use crate::error::{SyncError, SyncResult};
use crate::transport::RepoTransport;
use repsync_proto::{RepoPath, RepositoryDescriptor};

/// Parameters handed to a transport factory.
#[derive(Debug, Clone)]
pub struct TransportParams {
    /// Peer URL, e.g. `file:///var/repos/b`.
    pub url: String,
    /// Descriptor of the connecting (client) repository.
    pub client: RepositoryDescriptor,
    /// Subtree of the peer this connection is scoped to.
    pub path_prefix: RepoPath,
}

impl TransportParams {
    /// Creates parameters for an unscoped connection.
    pub fn new(url: impl Into<String>, client: RepositoryDescriptor) -> Self {
        Self {
            url: url.into(),
            client,
            path_prefix: RepoPath::root(),
        }
    }

    /// Scopes the connection to a subtree of the peer.
    #[must_use]
    pub fn with_path_prefix(mut self, prefix: RepoPath) -> Self {
        self.path_prefix = prefix;
        self
    }
}

/// A factory producing a connected transport from parameters.
pub type TransportFactory =
    Box<dyn Fn(&TransportParams) -> SyncResult<Box<dyn RepoTransport>> + Send + Sync>;

struct Registration {
    scheme: String,
    priority: i32,
    factory: TransportFactory,
}

/// Factory table mapping URL schemes to transport implementations.
#[derive(Default)]
pub struct TransportRegistry {
    entries: Vec<Registration>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a scheme. When several factories claim
    /// the same scheme, the highest priority wins.
    pub fn register(&mut self, scheme: impl Into<String>, priority: i32, factory: TransportFactory) {
        self.entries.push(Registration {
            scheme: scheme.into(),
            priority,
            factory,
        });
    }

    /// Extracts the scheme of a URL.
    #[must_use]
    pub fn scheme_of(url: &str) -> Option<&str> {
        url.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Opens a connection for the given parameters.
    pub fn open(&self, params: &TransportParams) -> SyncResult<Box<dyn RepoTransport>> {
        let scheme = Self::scheme_of(&params.url).ok_or_else(|| SyncError::UnknownScheme {
            scheme: params.url.clone(),
        })?;
        let registration = self
            .entries
            .iter()
            .filter(|r| r.scheme == scheme)
            .max_by_key(|r| r.priority)
            .ok_or_else(|| SyncError::UnknownScheme {
                scheme: scheme.to_string(),
            })?;
        (registration.factory)(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repsync_proto::RepoId;

    fn client() -> RepositoryDescriptor {
        RepositoryDescriptor::new(RepoId::new(), vec![], 1)
    }

    #[test]
    fn scheme_parsing() {
        assert_eq!(TransportRegistry::scheme_of("file:///a/b"), Some("file"));
        assert_eq!(TransportRegistry::scheme_of("https://host/x"), Some("https"));
        assert_eq!(TransportRegistry::scheme_of("not-a-url"), None);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let registry = TransportRegistry::new();
        let params = TransportParams::new("gopher://x", client());
        assert!(matches!(
            registry.open(&params),
            Err(SyncError::UnknownScheme { .. })
        ));
    }

    #[test]
    fn highest_priority_factory_wins() {
        let mut registry = TransportRegistry::new();
        registry.register(
            "test",
            0,
            Box::new(|_| Err(SyncError::transport_fatal("low"))),
        );
        registry.register(
            "test",
            10,
            Box::new(|_| Err(SyncError::transport_fatal("high"))),
        );

        let params = TransportParams::new("test://x", client());
        match registry.open(&params) {
            Err(SyncError::Transport { message, .. }) => assert_eq!(message, "high"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("factory unexpectedly succeeded"),
        }
    }
}
