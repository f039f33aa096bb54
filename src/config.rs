//! Connection configuration.
//!
//! Deliberately minimal: no file-format parsing, no environment variable
//! loading. The embedding application builds a `Config` directly, the same
//! way `brocaar-redis-rs::ConnectionInfo` is built by its caller.

#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

/// Where to connect. TCP is the common case; Unix domain sockets are
/// supported on platforms that have them, matching
/// `brocaar-redis-rs::aio::ActualConnection`'s `Tcp`/`Unix` split.
#[derive(Clone, Debug)]
pub enum Address {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

/// TLS parameters for an encrypted connection. `hostname` is required
/// whenever this is present (enforced by `Connection::make`), since RESP has
/// no certificate-verification story of its own.
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Builds a `ClientConfig` trusting the Mozilla root set bundled by
    /// `webpki-roots`, the common case for talking to a managed Redis
    /// provider over TLS. Callers with their own CA or client-cert
    /// requirements build `rustls::ClientConfig` directly instead.
    pub fn with_webpki_roots() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConfig {
            client_config: Arc::new(client_config),
        }
    }
}

/// Everything needed to establish and authenticate a connection.
#[derive(Clone, Debug)]
pub struct Config {
    pub address: Address,
    pub tls: Option<TlsConfig>,
    /// Required when `tls` is set; used for SNI and certificate verification.
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub initial_database: Option<i64>,
    /// Logging baggage: the target passed to every `log` call this
    /// connection makes, the facade's equivalent of a per-instance logger.
    pub log_target: &'static str,
}

impl Config {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Config {
            address: Address::Tcp {
                host: host.into(),
                port,
            },
            tls: None,
            hostname: None,
            username: None,
            password: None,
            initial_database: None,
            log_target: "redis_connection_core",
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_database(mut self, db: i64) -> Self {
        self.initial_database = Some(db);
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig, hostname: impl Into<String>) -> Self {
        self.tls = Some(tls);
        self.hostname = Some(hostname.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods_compose() {
        let config = Config::tcp("localhost", 6379)
            .with_username("alice")
            .with_password("hunter2")
            .with_database(3);

        assert!(matches!(config.address, Address::Tcp { port: 6379, .. }));
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.password.as_deref(), Some("hunter2"));
        assert_eq!(config.initial_database, Some(3));
        assert!(config.tls.is_none());
    }

    #[test]
    fn with_tls_requires_a_hostname_to_be_set_alongside_it() {
        let tls = TlsConfig::with_webpki_roots();
        let config = Config::tcp("redis.example.com", 6380).with_tls(tls, "redis.example.com");

        assert!(config.tls.is_some());
        assert_eq!(config.hostname.as_deref(), Some("redis.example.com"));
    }
}
