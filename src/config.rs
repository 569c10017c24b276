//! Configuration model and parsing
//!
//! The routing configuration is a list of virtual hosts, each optionally
//! carrying a balancing set and a middleware chain. Files are decoded as
//! JSON or YAML depending on the file extension.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Global configuration for the proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Virtual host definitions, in declaration order
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerSpec>,

    /// Seconds between health-check sweeps (0 disables the driver)
    #[serde(default)]
    pub healthcheck_interval: u64,

    /// Identifier of the log sink; parsed and carried, interpreted elsewhere
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_output: String,
}

/// A named virtual host or balancing member
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Unique name; doubles as the routing key (case-folded)
    pub name: String,

    /// Forwarding protocol, "http" or "https"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    /// Upstream host
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    /// Upstream port
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub port: u16,

    /// Full upstream URL; overrides protocol/host/port when it parses
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Initial health state, updated by the health checker at runtime
    #[serde(default)]
    pub is_healthy: bool,

    /// Redirect plain-HTTP requests for this host to HTTPS
    #[serde(default)]
    pub force_tls: bool,

    /// Balancing members; non-empty makes this a fan-out virtual host
    #[serde(rename = "balance", default, skip_serializing_if = "Vec::is_empty")]
    pub balance: Vec<ServerSpec>,

    /// Middleware chain applied in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<MiddlewareSpec>,
}

/// A middleware reference: registry name plus an opaque configuration value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

/// Configuration file format, discovered from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigFormat::Json => "json",
            ConfigFormat::Yaml => "yaml",
        }
    }
}

/// Discover the configuration format from the file extension,
/// case-insensitively. Unknown or missing extensions are an error.
pub fn discover_format<P: AsRef<Path>>(path: P) -> anyhow::Result<ConfigFormat> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("json") => Ok(ConfigFormat::Json),
        Some("yml") | Some("yaml") => Ok(ConfigFormat::Yaml),
        Some(other) => anyhow::bail!("unsupported config extension: .{}", other),
        None => anyhow::bail!("config path has no extension: {}", path.display()),
    }
}

/// Parse raw configuration bytes in the given format and validate the result.
pub fn parse_config(content: &[u8], format: ConfigFormat) -> anyhow::Result<Config> {
    let config: Config = match format {
        ConfigFormat::Json => serde_json::from_slice(content)?,
        ConfigFormat::Yaml => serde_yaml::from_slice(content)?,
    };
    config.validate()?;
    Ok(config)
}

/// Load and parse the configuration file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let format = discover_format(path)?;
    let content = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
    parse_config(&content, format)
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen: HashSet<String> = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.name.to_lowercase()) {
                anyhow::bail!("duplicate server name (case-folded): {}", server.name);
            }
            server.validate()?;
        }
        Ok(())
    }
}

impl ServerSpec {
    /// Validate this server and its balancing members
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("server name must not be empty");
        }
        self.resolved_url()
            .map_err(|e| anyhow::anyhow!("server '{}': {}", self.name, e))?;
        for member in &self.balance {
            member.validate()?;
        }
        Ok(())
    }

    /// Resolve the forwarding URL: the `url` field when it parses, otherwise
    /// `protocol://host:port` built from the individual fields.
    pub fn resolved_url(&self) -> anyhow::Result<String> {
        resolve_url(&self.url, &self.protocol, &self.host, self.port)
    }
}

/// Build a canonical upstream URL from an optional full URL or the
/// (protocol, host, port) triple.
pub fn resolve_url(url: &str, protocol: &str, host: &str, port: u16) -> anyhow::Result<String> {
    if !url.is_empty() && url.parse::<hyper::Uri>().is_ok() {
        return Ok(url.to_string());
    }
    if protocol != "http" && protocol != "https" {
        anyhow::bail!("protocol must be \"http\" or \"https\", got {:?}", protocol);
    }
    if host.is_empty() {
        anyhow::bail!("host must not be empty");
    }
    if port == 0 {
        anyhow::bail!("port must be in 1..=65535");
    }
    Ok(format!("{}://{}:{}", protocol, host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_format_case_insensitive() {
        assert_eq!(discover_format("conf.json").unwrap(), ConfigFormat::Json);
        assert_eq!(discover_format("conf.JSON").unwrap(), ConfigFormat::Json);
        assert_eq!(discover_format("conf.yml").unwrap(), ConfigFormat::Yaml);
        assert_eq!(discover_format("conf.yaml").unwrap(), ConfigFormat::Yaml);
        assert_eq!(discover_format("conf.YAML").unwrap(), ConfigFormat::Yaml);
        assert_eq!(discover_format("conf.json").unwrap().as_str(), "json");
        assert_eq!(discover_format("conf.yaml").unwrap().as_str(), "yaml");
    }

    #[test]
    fn test_discover_format_rejects_unknown() {
        assert!(discover_format("conf.txt").is_err());
        assert!(discover_format("conf.toml").is_err());
        assert!(discover_format("conf").is_err());
    }

    #[test]
    fn test_parse_json() {
        let content =
            br#"{"server":[{"name":"a","protocol":"http","host":"127.0.0.1","port":8080}]}"#;
        let config = parse_config(content, ConfigFormat::Json).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "a");
        assert_eq!(
            config.servers[0].resolved_url().unwrap(),
            "http://127.0.0.1:8080"
        );
    }

    #[test]
    fn test_parse_yaml() {
        let content = b"server:\n  - name: b\n    protocol: http\n    host: 127.0.0.1\n    port: 8081\nhealthcheck_interval: 30\n";
        let config = parse_config(content, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "b");
        assert_eq!(config.servers[0].port, 8081);
        assert_eq!(config.healthcheck_interval, 30);
        assert_eq!(
            config.servers[0].resolved_url().unwrap(),
            "http://127.0.0.1:8081"
        );
    }

    #[test]
    fn test_parse_yaml_with_balance_and_middlewares() {
        let content = br#"
server:
  - name: lb
    protocol: http
    host: 127.0.0.1
    port: 9000
    balance:
      - name: one
        url: "http://127.0.0.1:9001"
        is_healthy: true
      - name: two
        url: "http://127.0.0.1:9002"
        is_healthy: true
    middlewares:
      - name: "mogoly:ratelimiter"
        config:
          request_per_minute: 2
          limit_window: 1s
"#;
        let config = parse_config(content, ConfigFormat::Yaml).unwrap();
        let lb = &config.servers[0];
        assert_eq!(lb.balance.len(), 2);
        assert!(lb.balance[0].is_healthy);
        assert_eq!(lb.middlewares.len(), 1);
        assert_eq!(lb.middlewares[0].name, "mogoly:ratelimiter");
        assert_eq!(
            lb.middlewares[0].config["request_per_minute"],
            serde_json::json!(2)
        );
    }

    #[test]
    fn test_url_overrides_triple() {
        let spec = ServerSpec {
            name: "x".to_string(),
            url: "http://example.com/api".to_string(),
            ..Default::default()
        };
        assert_eq!(spec.resolved_url().unwrap(), "http://example.com/api");
    }

    #[test]
    fn test_incomplete_triple_rejected() {
        let spec = ServerSpec {
            name: "x".to_string(),
            protocol: "http".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        assert!(spec.resolved_url().is_err());

        let spec = ServerSpec {
            name: "x".to_string(),
            protocol: "gopher".to_string(),
            host: "127.0.0.1".to_string(),
            port: 80,
            ..Default::default()
        };
        assert!(spec.resolved_url().is_err());
    }

    #[test]
    fn test_duplicate_names_case_folded() {
        let content = br#"{"server":[
            {"name":"App","url":"http://127.0.0.1:1"},
            {"name":"app","url":"http://127.0.0.1:2"}
        ]}"#;
        let err = parse_config(content, ConfigFormat::Json).unwrap_err();
        assert!(err.to_string().contains("duplicate server name"));
    }

    #[test]
    fn test_parse_error_propagates() {
        assert!(parse_config(b"{not json", ConfigFormat::Json).is_err());
        assert!(parse_config(b"server: [", ConfigFormat::Yaml).is_err());
    }

    #[test]
    fn test_config_roundtrip_json() {
        let config = Config {
            servers: vec![ServerSpec {
                name: "a".to_string(),
                protocol: "http".to_string(),
                host: "127.0.0.1".to_string(),
                port: 8080,
                ..Default::default()
            }],
            healthcheck_interval: 10,
            log_output: String::new(),
        };
        let bytes = serde_json::to_vec(&config).unwrap();
        let parsed = parse_config(&bytes, ConfigFormat::Json).unwrap();
        assert_eq!(parsed.servers[0].name, "a");
        assert_eq!(parsed.healthcheck_interval, 10);
    }
}
