//! YAML configuration for building a server set and connection pool.

use crate::bind::{BindSpec, SimpleBindPolicy};
use crate::connection::{
    ConnectionOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_RESPONSE_TIMEOUT,
};
use crate::gssapi::{GssapiBindConfig, GssapiNegotiator, SaslQop, SecurityContextProvider};
use crate::health_check::{
    GetEntryHealthCheck, HealthCheck, HealthCheckPhases, WhoAmIHealthCheck, DEFAULT_MAX_RESPONSE_TIME,
};
use crate::ldap_protocol::SimpleBindRequest;
use crate::pool::{PoolOptions, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_MAX_CONNECTIONS};
use crate::server_set::{ServerCandidate, ServerSet, SrvRecord, StaticRecordResolver};
use crate::tls;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LDAP_PORT: u16 = 389;
pub const DEFAULT_LDAPS_PORT: u16 = 636;
pub const DEFAULT_SRV_TTL_SEC: u64 = 300;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Static candidates. Ignored when `srv` is set.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    pub srv: Option<SrvConfig>,
    /// Per-candidate connect timeout (default 5000).
    pub connect_timeout_ms: Option<u64>,
    /// Per-response read timeout (default 30000).
    pub response_timeout_ms: Option<u64>,
    /// Deadline for one failover pass over all candidates. Unbounded when unset.
    pub overall_timeout_ms: Option<u64>,
    /// Largest response message accepted, in bytes (default 20 MiB).
    pub max_message_size: Option<usize>,
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// ldap://host[:port] or ldaps://host[:port]
    pub uri: String,
    pub priority: Option<u16>,
    pub weight: Option<u16>,
}

/// Service-record input for the static resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrvConfig {
    pub name: String,
    #[serde(default)]
    pub records: Vec<SrvRecordConfig>,
    /// How long resolved records are cached (default 300).
    pub ttl_sec: Option<u64>,
    /// Connect to the resolved targets with ldaps.
    pub use_tls: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrvRecordConfig {
    #[serde(default)]
    pub priority: u16,
    #[serde(default)]
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMethod {
    #[default]
    None,
    Simple,
    Gssapi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindConfig {
    #[serde(default)]
    pub method: BindMethod,
    pub binddn: Option<String>,
    pub credentials: Option<String>,
    /// Send simple binds that have a DN but no password (default false).
    pub allow_empty_password: Option<bool>,
    pub gssapi: Option<GssapiConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GssapiConfig {
    pub authentication_id: String,
    pub authorization_id: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub kdc_address: Option<String>,
    /// Service principal protocol (default "ldap").
    pub protocol: Option<String>,
    pub config_file: Option<PathBuf>,
    pub refresh_krb5_config: Option<bool>,
    pub use_keytab: Option<bool>,
    pub keytab_path: Option<String>,
    /// Default true.
    pub use_ticket_cache: Option<bool>,
    pub ticket_cache_path: Option<String>,
    pub require_cached_credentials: Option<bool>,
    pub renew_tgt: Option<bool>,
    /// auth, auth-int, auth-conf (default [auth]).
    pub allowed_qop: Option<Vec<String>>,
    #[serde(default)]
    pub suppressed_properties: Vec<String>,
    pub sasl_client_server_name: Option<String>,
    pub is_initiator: Option<bool>,
    pub debug: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckKind {
    None,
    #[default]
    Whoami,
    GetEntry,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Default 1.
    pub initial_connections: Option<usize>,
    /// Default 10.
    pub max_connections: Option<usize>,
    /// How long checkout waits at capacity; 0 (default) fails at once.
    pub max_wait_ms: Option<u64>,
    pub max_connection_age_sec: Option<u64>,
    /// Background sweep interval (default 60).
    pub health_check_interval_sec: Option<u64>,
    #[serde(default)]
    pub health_check: HealthCheckKind,
    /// Entry read by the get_entry check. Empty means the root DSE.
    pub health_check_entry_dn: Option<String>,
    /// Default 5.
    pub health_check_timeout_sec: Option<u64>,
    pub check_on_checkout: Option<bool>,
    pub check_on_release: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Do not verify server certificates (test/internal networks only).
    pub skip_verify: Option<bool>,
    /// Extra PEM CA bundle, trusted in addition to the system roots.
    pub ca_file: Option<String>,
}

/// Parse "ldap://host[:port]" or "ldaps://host[:port]" to (host, port, use_tls).
pub fn parse_ldap_uri(uri: &str) -> Result<(String, u16, bool)> {
    let (rest, use_tls) = if let Some(r) = uri.strip_prefix("ldaps://") {
        (r, true)
    } else if let Some(r) = uri.strip_prefix("ldap://") {
        (r, false)
    } else {
        anyhow::bail!("Invalid LDAP URI scheme: {}", uri);
    };
    let authority = rest.split('/').next().unwrap_or_default();
    let default_port = if use_tls { DEFAULT_LDAPS_PORT } else { DEFAULT_LDAP_PORT };
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("Unterminated IPv6 address in URI: {}", uri))?;
        match after.strip_prefix(':') {
            Some(p) => (host, p),
            None => (host, ""),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => (h, p),
            None => (authority, ""),
        }
    };
    if host.is_empty() {
        anyhow::bail!("No host in URI: {}", uri);
    }
    let port = if port.is_empty() {
        default_port
    } else {
        port.parse()
            .with_context(|| format!("Invalid port in URI: {}", uri))?
    };
    Ok((host.to_string(), port, use_tls))
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML configuration")?;
        Ok(config)
    }

    fn uses_tls(&self) -> Result<bool> {
        if let Some(ref srv) = self.srv {
            return Ok(srv.use_tls.unwrap_or(false));
        }
        for s in &self.servers {
            if parse_ldap_uri(&s.uri)?.2 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn connection_options(&self) -> Result<ConnectionOptions> {
        let tls = if self.uses_tls()? {
            let t = self.tls.clone().unwrap_or_default();
            Some(tls::client_config(t.skip_verify.unwrap_or(false), t.ca_file.as_deref())?)
        } else {
            None
        };
        Ok(ConnectionOptions {
            connect_timeout: self
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            response_timeout: self
                .response_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RESPONSE_TIMEOUT),
            tls,
            max_message_size: self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
        })
    }

    /// Static candidates from `servers`.
    pub fn candidates(&self) -> Result<Vec<ServerCandidate>> {
        self.servers
            .iter()
            .map(|s| {
                let (host, port, use_tls) = parse_ldap_uri(&s.uri)?;
                Ok(ServerCandidate::new(host, port)
                    .with_priority(s.priority.unwrap_or(0))
                    .with_weight(s.weight.unwrap_or(1))
                    .with_tls(use_tls))
            })
            .collect()
    }

    /// Bind applied to every new connection. A GSSAPI bind needs the platform
    /// security provider that performs the Kerberos exchange.
    pub fn bind_spec(&self, provider: Option<Arc<dyn SecurityContextProvider>>) -> Result<Option<BindSpec>> {
        let b = &self.bind;
        match b.method {
            BindMethod::None => Ok(None),
            BindMethod::Simple => {
                let request = SimpleBindRequest::new(
                    b.binddn.clone().unwrap_or_default(),
                    b.credentials.clone().unwrap_or_default(),
                );
                let policy = SimpleBindPolicy {
                    allow_empty_password: b.allow_empty_password.unwrap_or(false),
                };
                policy.check(&request)?;
                Ok(Some(BindSpec::Simple { request, policy }))
            }
            BindMethod::Gssapi => {
                let g = b
                    .gssapi
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("bind.method is gssapi but bind.gssapi is missing"))?;
                let provider = provider.ok_or_else(|| {
                    anyhow::anyhow!("GSSAPI bind requires a platform security provider, none is available")
                })?;
                let negotiator = GssapiNegotiator::new(g.to_bind_config()?, provider)?;
                Ok(Some(BindSpec::Gssapi(negotiator)))
            }
        }
    }

    pub fn server_set(&self, provider: Option<Arc<dyn SecurityContextProvider>>) -> Result<ServerSet> {
        let options = self.connection_options()?;
        let mut set = if let Some(ref srv) = self.srv {
            let records = srv
                .records
                .iter()
                .map(|r| SrvRecord {
                    priority: r.priority,
                    weight: r.weight,
                    port: r.port,
                    target: r.target.clone(),
                })
                .collect();
            let ttl = Duration::from_secs(srv.ttl_sec.unwrap_or(DEFAULT_SRV_TTL_SEC));
            ServerSet::from_service_records(
                srv.name.clone(),
                Arc::new(StaticRecordResolver::new(records, ttl)),
                srv.use_tls.unwrap_or(false),
                options,
            )
        } else {
            let candidates = self.candidates()?;
            if candidates.is_empty() {
                anyhow::bail!("No servers configured (set servers or srv)");
            }
            ServerSet::new_static(candidates, options)
        };
        if let Some(bind) = self.bind_spec(provider)? {
            set = set.with_bind(bind);
        }
        if let Some(ms) = self.overall_timeout_ms {
            set = set.with_overall_timeout(Duration::from_millis(ms));
        }
        Ok(set)
    }

    pub fn pool_options(&self) -> PoolOptions {
        let p = &self.pool;
        PoolOptions {
            initial_connections: p.initial_connections.unwrap_or(1),
            max_connections: p.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            max_wait: Duration::from_millis(p.max_wait_ms.unwrap_or(0)),
            max_connection_age: p.max_connection_age_sec.map(Duration::from_secs),
            health_check_interval: p
                .health_check_interval_sec
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL),
        }
    }

    pub fn health_check(&self) -> Option<Arc<dyn HealthCheck>> {
        let p = &self.pool;
        let phases = HealthCheckPhases {
            on_checkout: p.check_on_checkout.unwrap_or(false),
            on_release: p.check_on_release.unwrap_or(false),
            ..HealthCheckPhases::default()
        };
        let max_response_time = p
            .health_check_timeout_sec
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAX_RESPONSE_TIME);
        match p.health_check {
            HealthCheckKind::None => None,
            HealthCheckKind::Whoami => Some(Arc::new(WhoAmIHealthCheck {
                max_response_time,
                phases,
            })),
            HealthCheckKind::GetEntry => Some(Arc::new(
                GetEntryHealthCheck::new(p.health_check_entry_dn.clone().unwrap_or_default())
                    .with_max_response_time(max_response_time)
                    .with_phases(phases),
            )),
        }
    }
}

impl GssapiConfig {
    pub fn to_bind_config(&self) -> Result<GssapiBindConfig> {
        let defaults = GssapiBindConfig::default();
        let allowed_qop = match self.allowed_qop {
            Some(ref names) => names
                .iter()
                .map(|n| n.parse::<SaslQop>())
                .collect::<std::result::Result<Vec<_>, _>>()?,
            None => defaults.allowed_qop.clone(),
        };
        let config = GssapiBindConfig {
            authentication_id: self.authentication_id.clone(),
            authorization_id: self.authorization_id.clone(),
            password: self.password.as_ref().map(|p| p.as_bytes().to_vec()),
            realm: self.realm.clone(),
            kdc_address: self.kdc_address.clone(),
            service_principal_protocol: self
                .protocol
                .clone()
                .unwrap_or(defaults.service_principal_protocol),
            config_file_path: self.config_file.clone(),
            refresh_krb5_config: self.refresh_krb5_config.unwrap_or(false),
            use_key_tab: self.use_keytab.unwrap_or(false),
            key_tab_path: self.keytab_path.clone(),
            use_ticket_cache: self.use_ticket_cache.unwrap_or(defaults.use_ticket_cache),
            ticket_cache_path: self.ticket_cache_path.clone(),
            require_cached_credentials: self.require_cached_credentials.unwrap_or(false),
            renew_tgt: self.renew_tgt.unwrap_or(false),
            allowed_qop,
            suppressed_properties: self.suppressed_properties.clone(),
            sasl_client_server_name: self.sasl_client_server_name.clone(),
            is_initiator: self.is_initiator,
            enable_debugging: self.debug.unwrap_or(false),
            jaas_client_name: defaults.jaas_client_name,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.servers.is_empty());
        assert!(config.srv.is_none());
        assert_eq!(config.bind.method, BindMethod::None);
        assert_eq!(config.pool.health_check, HealthCheckKind::Whoami);
        let pool = config.pool_options();
        assert_eq!(pool.initial_connections, 1);
        assert_eq!(pool.max_connections, 10);
        assert_eq!(pool.max_wait, Duration::ZERO);
        assert_eq!(pool.health_check_interval, Duration::from_secs(60));
        let opts = config.connection_options().unwrap();
        assert_eq!(opts.connect_timeout, Duration::from_secs(5));
        assert_eq!(opts.response_timeout, Duration::from_secs(30));
        assert!(opts.tls.is_none());
        assert_eq!(opts.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_parse_ldap_uri() {
        assert_eq!(
            parse_ldap_uri("ldap://ldap1.example.com:1389").unwrap(),
            ("ldap1.example.com".to_string(), 1389, false)
        );
        assert_eq!(
            parse_ldap_uri("ldap://ldap1.example.com").unwrap(),
            ("ldap1.example.com".to_string(), 389, false)
        );
        assert_eq!(
            parse_ldap_uri("ldaps://ldap2/dc=example,dc=com").unwrap(),
            ("ldap2".to_string(), 636, true)
        );
        assert_eq!(parse_ldap_uri("ldap://[::1]:3389").unwrap(), ("::1".to_string(), 3389, false));
        assert!(parse_ldap_uri("http://ldap1:389").is_err());
        assert!(parse_ldap_uri("ldap://ldap1:notaport").is_err());
        assert!(parse_ldap_uri("ldap://:389").is_err());
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
servers:
  - uri: "ldap://ldap1.example.com:389"
    priority: 1
  - uri: "ldap://ldap2.example.com"
    priority: 2
    weight: 5
connect_timeout_ms: 1500
overall_timeout_ms: 4000
max_message_size: 65536
bind:
  method: simple
  binddn: "cn=admin,dc=example,dc=com"
  credentials: "password"
pool:
  initial_connections: 2
  max_connections: 8
  max_wait_ms: 250
  max_connection_age_sec: 600
  health_check: get_entry
  health_check_entry_dn: "cn=monitor"
  check_on_checkout: true
"#;
        let config = Config::from_str(yaml).unwrap();
        let candidates = config.candidates().unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].host, "ldap1.example.com");
        assert_eq!(candidates[0].priority, 1);
        assert_eq!(candidates[0].weight, 1);
        assert_eq!(candidates[1].port, 389);
        assert_eq!(candidates[1].weight, 5);
        assert_eq!(config.bind.method, BindMethod::Simple);
        assert!(matches!(config.bind_spec(None).unwrap(), Some(BindSpec::Simple { .. })));

        let pool = config.pool_options();
        assert_eq!(pool.initial_connections, 2);
        assert_eq!(pool.max_connections, 8);
        assert_eq!(pool.max_wait, Duration::from_millis(250));
        assert_eq!(pool.max_connection_age, Some(Duration::from_secs(600)));
        assert!(config.health_check().is_some());
        assert_eq!(
            config.connection_options().unwrap().connect_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(config.connection_options().unwrap().max_message_size, 65536);
        assert!(config.server_set(None).is_ok());
    }

    #[test]
    fn test_empty_password_rejected_unless_allowed() {
        let yaml = r#"
servers:
  - uri: "ldap://localhost"
bind:
  method: simple
  binddn: "cn=Manager"
"#;
        let mut config = Config::from_str(yaml).unwrap();
        let err = config.bind_spec(None).unwrap_err();
        assert!(err.to_string().contains("parameter error"));
        config.bind.allow_empty_password = Some(true);
        assert!(config.bind_spec(None).unwrap().is_some());
    }

    #[test]
    fn test_gssapi_section() {
        let yaml = r#"
servers:
  - uri: "ldap://kdc-backed.example.com"
bind:
  method: gssapi
  gssapi:
    authentication_id: "u@EX.COM"
    password: "p"
    realm: "EX.COM"
    allowed_qop: ["auth-int", "auth"]
    is_initiator: true
"#;
        let config = Config::from_str(yaml).unwrap();
        let gssapi = config.bind.gssapi.as_ref().unwrap().to_bind_config().unwrap();
        assert_eq!(gssapi.authentication_id, "u@EX.COM");
        assert_eq!(gssapi.password.as_deref(), Some(b"p".as_slice()));
        assert_eq!(gssapi.service_principal_protocol, "ldap");
        assert_eq!(gssapi.allowed_qop, vec![SaslQop::AuthInt, SaslQop::Auth]);
        assert!(gssapi.use_ticket_cache);
        assert_eq!(gssapi.is_initiator, Some(true));

        let err = config.bind_spec(None).unwrap_err();
        assert!(err.to_string().contains("security provider"));
    }

    #[test]
    fn test_srv_section() {
        let yaml = r#"
srv:
  name: "_ldap._tcp.example.com"
  ttl_sec: 30
  records:
    - { priority: 0, weight: 10, port: 389, target: "ldap1.example.com." }
pool:
  health_check: none
"#;
        let config = Config::from_str(yaml).unwrap();
        let srv = config.srv.as_ref().unwrap();
        assert_eq!(srv.records.len(), 1);
        assert_eq!(srv.ttl_sec, Some(30));
        assert!(config.health_check().is_none());
        assert!(config.server_set(None).is_ok());
    }

    #[test]
    fn test_no_servers() {
        assert!(Config::default().server_set(None).is_err());
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
servers:
  - uri: "ldap://localhost:389"
pool:
  max_connections: 3
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.pool.max_connections, Some(3));
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        assert!(Config::from_str("invalid: yaml: content: [").is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }
}
