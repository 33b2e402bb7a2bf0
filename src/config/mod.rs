//! Configuration management for the MCP hub.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::mcp::client::ClientConfig;

/// Default prefix for internal tool names.
pub const DEFAULT_TOOL_PREFIX: &str = "hub";

/// Command-line arguments for the MCP hub.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-hub")]
#[command(author = "MCP Hub Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bidirectional MCP runtime: aggregate external MCP servers and serve them as one")]
pub struct Args {
    /// Server name reported to clients
    #[arg(long, default_value = "mcp-hub", env = "MCP_HUB_NAME")]
    pub name: String,

    /// Serving mode: stdio or http
    #[arg(short, long, default_value = "stdio", env = "MCP_HUB_MODE")]
    pub mode: Mode,

    /// HTTP bind address (only for http mode)
    #[arg(long, default_value = "127.0.0.1", env = "MCP_HUB_HOST")]
    pub host: String,

    /// HTTP port (only for http mode)
    #[arg(short, long, default_value = "3000", env = "MCP_HUB_PORT")]
    pub port: u16,

    /// Enable debug logging
    #[arg(short, long, env = "MCP_HUB_DEBUG")]
    pub debug: bool,

    /// Emit logs as JSON
    #[arg(long, env = "MCP_HUB_LOG_JSON")]
    pub log_json: bool,

    /// Prefix for internal tool names
    #[arg(long, default_value = DEFAULT_TOOL_PREFIX, env = "MCP_HUB_TOOL_PREFIX")]
    pub prefix: String,

    /// Per-request timeout for external servers (milliseconds)
    #[arg(long, default_value = "30000", env = "MCP_HUB_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// YAML file listing external MCP servers
    #[arg(short, long, env = "MCP_HUB_SERVERS")]
    pub servers: Option<PathBuf>,

    /// Instructions returned to clients on initialize
    #[arg(long, env = "MCP_HUB_INSTRUCTIONS")]
    pub instructions: Option<String>,
}

/// Serving mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Stdio,
    Http,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server name
    pub name: String,
    /// Serving mode
    pub mode: Mode,
    /// HTTP bind address
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// Debug mode
    pub debug: bool,
    /// JSON log output
    pub log_json: bool,
    /// Internal tool prefix
    pub prefix: String,
    /// Default request timeout for external servers
    pub request_timeout_ms: u64,
    /// External servers file
    pub servers_file: Option<PathBuf>,
    /// Initialize instructions
    pub instructions: Option<String>,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            name: args.name,
            mode: args.mode,
            host: args.host,
            port: args.port,
            debug: args.debug,
            log_json: args.log_json,
            prefix: args.prefix,
            request_timeout_ms: args.request_timeout_ms,
            servers_file: args.servers.or_else(|| default_servers_path().filter(|p| p.exists())),
            instructions: args.instructions,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "mcp-hub".to_string(),
            mode: Mode::Stdio,
            host: "127.0.0.1".to_string(),
            port: 3000,
            debug: false,
            log_json: false,
            prefix: DEFAULT_TOOL_PREFIX.to_string(),
            request_timeout_ms: 30_000,
            servers_file: None,
            instructions: None,
        }
    }
}

impl Config {
    /// External servers to connect at startup, enabled ones only.
    ///
    /// Entries without their own timeout inherit `request_timeout_ms`.
    pub fn load_servers(&self) -> Result<Vec<ClientConfig>> {
        let Some(path) = &self.servers_file else {
            return Ok(Vec::new());
        };
        Ok(ServersFile::load(path)?
            .servers
            .into_iter()
            .filter(|s| s.enabled)
            .map(|mut s| {
                s.timeout_ms.get_or_insert(self.request_timeout_ms);
                s
            })
            .collect())
    }
}

/// `<config_dir>/mcp-hub/servers.yaml`.
pub fn default_servers_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mcp-hub").join("servers.yaml"))
}

/// Contents of the servers file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub servers: Vec<ClientConfig>,
}

impl ServersFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: ServersFile = serde_yaml::from_str(text)?;
        let mut names = std::collections::HashSet::new();
        for server in &file.servers {
            if server.name.is_empty() {
                return Err(Error::Config("server entry without a name".to_string()));
            }
            if !names.insert(server.name.as_str()) {
                return Err(Error::Config(format!("duplicate server name: {}", server.name)));
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::TransportConfig;
    use std::io::Write;

    #[test]
    fn test_mode_default() {
        assert_eq!(Mode::default(), Mode::Stdio);
    }

    #[test]
    fn test_mode_serialization() {
        let modes = [(Mode::Stdio, "\"stdio\""), (Mode::Http, "\"http\"")];

        for (mode, expected) in &modes {
            let json = serde_json::to_string(mode).unwrap();
            assert_eq!(json, *expected);
        }

        let http: Mode = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(http, Mode::Http);
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.name, "mcp-hub");
        assert_eq!(config.mode, Mode::Stdio);
        assert_eq!(config.port, 3000);
        assert_eq!(config.prefix, "hub");
        assert_eq!(config.request_timeout_ms, 30_000);
        assert!(config.servers_file.is_none());
        assert!(config.load_servers().unwrap().is_empty());
    }

    #[test]
    fn test_args_to_config() {
        let args = Args::parse_from([
            "mcp-hub",
            "--mode",
            "http",
            "--port",
            "4000",
            "--prefix",
            "ycrm",
            "--servers",
            "/etc/mcp-hub/servers.yaml",
            "--debug",
        ]);

        let config: Config = args.into();

        assert_eq!(config.mode, Mode::Http);
        assert_eq!(config.port, 4000);
        assert_eq!(config.prefix, "ycrm");
        assert!(config.debug);
        assert_eq!(config.servers_file, Some(PathBuf::from("/etc/mcp-hub/servers.yaml")));
    }

    #[test]
    fn test_servers_file_parse() {
        let yaml = r#"
servers:
  - name: acme
    transport: { type: stdio, command: acme-mcp, args: ["--quiet"], env: { ACME_TOKEN: secret } }
    timeout_ms: 10000
  - name: remote
    transport: { type: sse, url: "http://localhost:3001/sse" }
    enabled: false
"#;
        let file = ServersFile::parse(yaml).unwrap();
        assert_eq!(file.servers.len(), 2);
        assert_eq!(file.servers[0].timeout_ms, Some(10_000));
        assert_eq!(file.servers[1].timeout_ms, None);
        match &file.servers[0].transport {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.command, "acme-mcp");
                assert_eq!(stdio.env.get("ACME_TOKEN").map(String::as_str), Some("secret"));
            }
            other => panic!("Expected stdio, got {:?}", other),
        }
        assert!(!file.servers[1].enabled);
    }

    #[test]
    fn test_servers_file_rejects_duplicates() {
        let yaml = "servers:\n  - name: a\n    transport: {type: sse, url: 'http://x/sse'}\n  - name: a\n    transport: {type: sse, url: 'http://y/sse'}\n";
        assert!(matches!(ServersFile::parse(yaml), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_servers_skips_disabled() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "servers:\n  - name: on\n    transport: {{type: sse, url: 'http://x/sse'}}\n  - name: off\n    enabled: false\n    transport: {{type: sse, url: 'http://y/sse'}}"
        )
        .unwrap();

        let config = Config {
            servers_file: Some(file.path().to_path_buf()),
            ..Config::default()
        };
        let servers = config.load_servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "on");
        assert_eq!(servers[0].timeout_ms, Some(30_000));
    }

    #[test]
    fn test_missing_servers_file_is_config_error() {
        let config = Config {
            servers_file: Some(PathBuf::from("/definitely/missing/servers.yaml")),
            ..Config::default()
        };
        assert!(matches!(config.load_servers(), Err(Error::Config(_))));
    }
}
