//! Configuration system.
//!
//! Loads client/server configuration from JSON strings/files (file IO left
//! to the binaries) and parses `<scheme>://[<password>@]host[:port]`
//! connection URIs.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default TCP/UDP port of the collaboration server.
pub const DEFAULT_PORT: u16 = 26000;

/// URI scheme accepted by the client.
pub const URI_SCHEME: &str = "collab";

/// Server-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP listen port; the UDP socket binds the same port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Session password; empty means open access.
    #[serde(default)]
    pub password: String,
    /// Name reported to clients in the connect reply.
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_server_name() -> String {
    "Collaboration Server".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            password: String::new(),
            server_name: default_server_name(),
        }
    }
}

impl ServerConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection URI, e.g. `collab://secret@example.org:26000`.
    pub server_uri: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_client_name() -> String {
    "Anonymous".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_uri: format!("{URI_SCHEME}://localhost:{DEFAULT_PORT}"),
            client_name: default_client_name(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Parsed form of a connection URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUri {
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
}

impl ServerUri {
    /// Parses `<scheme>://[<password>@]host[:port]`; the scheme and port
    /// may be omitted.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = match uri.split_once("://") {
            Some((scheme, rest)) => {
                if scheme != URI_SCHEME {
                    bail!("unsupported URI scheme {scheme:?}");
                }
                rest
            }
            None => uri,
        };

        let (password, rest) = match rest.rsplit_once('@') {
            Some((password, rest)) => (Some(password.to_string()), rest),
            None => (None, rest),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .with_context(|| format!("invalid port {port:?}"))?,
            ),
            None => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            bail!("empty host in URI {uri:?}");
        }

        Ok(ServerUri {
            password,
            host: host.to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_uri() {
        let uri = ServerUri::parse("collab://secret@example.org:4000").unwrap();
        assert_eq!(
            uri,
            ServerUri {
                password: Some("secret".to_string()),
                host: "example.org".to_string(),
                port: 4000,
            }
        );
    }

    #[test]
    fn parse_applies_defaults() {
        let uri = ServerUri::parse("example.org").unwrap();
        assert_eq!(uri.password, None);
        assert_eq!(uri.host, "example.org");
        assert_eq!(uri.port, DEFAULT_PORT);
    }

    #[test]
    fn parse_rejects_foreign_scheme() {
        assert!(ServerUri::parse("http://example.org").is_err());
        assert!(ServerUri::parse("collab://").is_err());
    }

    #[test]
    fn server_config_from_json() {
        let config = ServerConfig::from_json_str(r#"{"port": 1234}"#).unwrap();
        assert_eq!(config.port, 1234);
        assert_eq!(config.server_name, "Collaboration Server");
        assert!(config.password.is_empty());
    }
}
