//! Kerberos-backed SASL (GSSAPI) bind negotiation.
//!
//! The Kerberos exchange itself belongs to a platform security library, reached
//! through [`SecurityContextProvider`]. This module owns what that library is
//! given: a generated login configuration file, a property map and answers to
//! its credential callbacks. It then drives the SASL bind exchange over the
//! connection until the server reports success or failure.

use crate::connection::LdapConnection;
use crate::error::{LdapError, Result, ResultCode};
use crate::ldap_protocol::{LdapResult, SaslBindRequest};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tempfile::TempPath;
use tracing::{debug, warn};

pub const GSSAPI_MECHANISM: &str = "GSSAPI";
pub const DEFAULT_SERVICE_PRINCIPAL_PROTOCOL: &str = "ldap";
pub const DEFAULT_JAAS_CLIENT_NAME: &str = "GSSAPIBindRequest";

pub const PROPERTY_REALM: &str = "java.security.krb5.realm";
pub const PROPERTY_KDC: &str = "java.security.krb5.kdc";
pub const PROPERTY_DEBUG: &str = "sun.security.krb5.debug";
pub const PROPERTY_LOGIN_CONFIG: &str = "java.security.auth.login.config";
pub const PROPERTY_USE_SUBJECT_CREDS_ONLY: &str = "javax.security.auth.useSubjectCredsOnly";
pub const PROPERTY_QOP: &str = "javax.security.sasl.qop";

const MAX_SASL_ROUNDS: usize = 32;

/// SASL quality of protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaslQop {
    Auth,
    AuthInt,
    AuthConf,
}

impl SaslQop {
    pub fn as_str(self) -> &'static str {
        match self {
            SaslQop::Auth => "auth",
            SaslQop::AuthInt => "auth-int",
            SaslQop::AuthConf => "auth-conf",
        }
    }

    /// Comma-separated property value, in preference order.
    pub fn to_property_value(qops: &[SaslQop]) -> String {
        qops.iter().map(|q| q.as_str()).collect::<Vec<_>>().join(",")
    }
}

impl FromStr for SaslQop {
    type Err = LdapError;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Ok(SaslQop::Auth),
            "auth-int" => Ok(SaslQop::AuthInt),
            "auth-conf" => Ok(SaslQop::AuthConf),
            other => Err(LdapError::BindParameter(format!("unknown SASL QoP '{}'", other))),
        }
    }
}

#[derive(Clone)]
pub struct GssapiBindConfig {
    pub authentication_id: String,
    pub authorization_id: Option<String>,
    pub password: Option<Vec<u8>>,
    pub realm: Option<String>,
    pub kdc_address: Option<String>,
    pub service_principal_protocol: String,
    /// Existing login configuration file; generated when unset.
    pub config_file_path: Option<PathBuf>,
    pub refresh_krb5_config: bool,
    pub use_key_tab: bool,
    pub key_tab_path: Option<String>,
    pub use_ticket_cache: bool,
    pub ticket_cache_path: Option<String>,
    pub require_cached_credentials: bool,
    pub renew_tgt: bool,
    pub allowed_qop: Vec<SaslQop>,
    /// Property names that must not be handed to the platform library.
    pub suppressed_properties: Vec<String>,
    /// Server name for the SASL client; defaults to the connection's host.
    pub sasl_client_server_name: Option<String>,
    pub is_initiator: Option<bool>,
    pub enable_debugging: bool,
    pub jaas_client_name: String,
}

impl Default for GssapiBindConfig {
    fn default() -> Self {
        Self {
            authentication_id: String::new(),
            authorization_id: None,
            password: None,
            realm: None,
            kdc_address: None,
            service_principal_protocol: DEFAULT_SERVICE_PRINCIPAL_PROTOCOL.to_string(),
            config_file_path: None,
            refresh_krb5_config: false,
            use_key_tab: false,
            key_tab_path: None,
            use_ticket_cache: true,
            ticket_cache_path: None,
            require_cached_credentials: false,
            renew_tgt: false,
            allowed_qop: vec![SaslQop::Auth],
            suppressed_properties: Vec::new(),
            sasl_client_server_name: None,
            is_initiator: None,
            enable_debugging: false,
            jaas_client_name: DEFAULT_JAAS_CLIENT_NAME.to_string(),
        }
    }
}

impl GssapiBindConfig {
    pub fn new(authentication_id: impl Into<String>) -> Self {
        Self {
            authentication_id: authentication_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.authentication_id.trim().is_empty() {
            return Err(LdapError::BindParameter(
                "GSSAPI bind requires an authentication ID".to_string(),
            ));
        }
        if self.service_principal_protocol.trim().is_empty() {
            return Err(LdapError::BindParameter(
                "GSSAPI bind requires a service principal protocol".to_string(),
            ));
        }
        if self.allowed_qop.is_empty() {
            return Err(LdapError::BindParameter(
                "at least one SASL QoP must be allowed".to_string(),
            ));
        }
        if self.use_key_tab && self.key_tab_path.as_deref().map(str::is_empty) == Some(true) {
            return Err(LdapError::BindParameter("keytab path is empty".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for GssapiBindConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GssapiBindConfig")
            .field("authentication_id", &self.authentication_id)
            .field("authorization_id", &self.authorization_id)
            .field("password_set", &self.password.is_some())
            .field("realm", &self.realm)
            .field("kdc_address", &self.kdc_address)
            .field("service_principal_protocol", &self.service_principal_protocol)
            .field("config_file_path", &self.config_file_path)
            .field("use_key_tab", &self.use_key_tab)
            .field("use_ticket_cache", &self.use_ticket_cache)
            .field("require_cached_credentials", &self.require_cached_credentials)
            .field("allowed_qop", &self.allowed_qop)
            .field("is_initiator", &self.is_initiator)
            .field("enable_debugging", &self.enable_debugging)
            .finish()
    }
}

/// Credential request issued by the platform library during login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Name {
        prompt: String,
        answer: Option<String>,
    },
    Password {
        prompt: String,
        answer: Option<Vec<u8>>,
    },
    Realm {
        prompt: String,
        default_text: Option<String>,
        answer: Option<String>,
    },
    Language {
        answer: Option<String>,
    },
    /// Any callback type the negotiator does not know how to answer.
    Other(String),
}

impl Callback {
    pub fn name(prompt: &str) -> Self {
        Callback::Name {
            prompt: prompt.to_string(),
            answer: None,
        }
    }

    pub fn password(prompt: &str) -> Self {
        Callback::Password {
            prompt: prompt.to_string(),
            answer: None,
        }
    }

    pub fn realm(prompt: &str, default_text: Option<&str>) -> Self {
        Callback::Realm {
            prompt: prompt.to_string(),
            default_text: default_text.map(str::to_string),
            answer: None,
        }
    }

    pub fn language() -> Self {
        Callback::Language { answer: None }
    }
}

pub trait CallbackHandler: Send + Sync {
    /// Fill in answers; any error aborts the login attempt.
    fn handle(&self, callbacks: &mut [Callback]) -> Result<()>;
}

/// What the platform library is given to perform a login.
#[derive(Debug, Clone)]
pub struct LoginContext<'a> {
    pub client_name: &'a str,
    pub config_file: &'a Path,
    pub properties: &'a BTreeMap<String, String>,
}

/// Opaque credentials returned by the platform library.
#[derive(Clone)]
pub struct AcquiredCredentials {
    pub principal: String,
    pub acquired_at: Instant,
    pub handle: Arc<dyn std::any::Any + Send + Sync>,
}

impl AcquiredCredentials {
    pub fn new(principal: impl Into<String>, handle: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        Self {
            principal: principal.into(),
            acquired_at: Instant::now(),
            handle,
        }
    }
}

impl fmt::Debug for AcquiredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredCredentials")
            .field("principal", &self.principal)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SaslClientRequest<'a> {
    pub mechanism: &'a str,
    pub authorization_id: Option<&'a str>,
    pub protocol: &'a str,
    pub server_name: &'a str,
    pub properties: &'a BTreeMap<String, String>,
}

impl SaslClientRequest<'_> {
    /// `<protocol>@<server>`
    pub fn service_principal(&self) -> String {
        format!("{}@{}", self.protocol, self.server_name)
    }
}

/// Mechanism state for one bind attempt.
pub trait SaslClient: Send {
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>>;
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>>;
    fn is_complete(&self) -> bool;
}

/// Boundary to the platform Kerberos/GSSAPI implementation.
pub trait SecurityContextProvider: Send + Sync {
    fn acquire_credentials(
        &self,
        login: &LoginContext<'_>,
        handler: &dyn CallbackHandler,
    ) -> Result<AcquiredCredentials>;

    fn new_client(
        &self,
        credentials: &AcquiredCredentials,
        request: &SaslClientRequest<'_>,
    ) -> Result<Box<dyn SaslClient>>;
}

static LOGIN_CONFIG_FILES: OnceLock<DashMap<String, TempPath>> = OnceLock::new();

/// Write `content` to a temporary file, reusing the file already written for
/// identical content.
fn cached_login_config_file(content: &str) -> Result<PathBuf> {
    let files = LOGIN_CONFIG_FILES.get_or_init(DashMap::new);
    match files.entry(content.to_string()) {
        MapEntry::Occupied(e) => Ok(e.get().to_path_buf()),
        MapEntry::Vacant(v) => {
            let mut file = tempfile::Builder::new()
                .prefix("ldap-gssapi-")
                .suffix(".conf")
                .tempfile()?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
            let path = file.into_temp_path();
            debug!("Generated GSSAPI login configuration {}", path.display());
            Ok(v.insert(path).to_path_buf())
        }
    }
}

/// GSSAPI negotiator bound to one target server.
#[derive(Clone)]
pub struct GssapiNegotiator {
    config: Arc<GssapiBindConfig>,
    provider: Arc<dyn SecurityContextProvider>,
    target: Option<(String, u16)>,
    credentials: Arc<Mutex<Option<AcquiredCredentials>>>,
    bind_lock: Arc<tokio::sync::Mutex<()>>,
}

impl fmt::Debug for GssapiNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GssapiNegotiator")
            .field("config", &self.config)
            .field("target", &self.target)
            .finish()
    }
}

impl GssapiNegotiator {
    pub fn new(config: GssapiBindConfig, provider: Arc<dyn SecurityContextProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            provider,
            target: None,
            credentials: Arc::new(Mutex::new(None)),
            bind_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn config(&self) -> &GssapiBindConfig {
        &self.config
    }

    pub fn target(&self) -> Option<(&str, u16)> {
        self.target.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    /// Same configuration, new target. Acquired credentials carry over unless
    /// `require_cached_credentials` is set; negotiators sharing credentials
    /// also share the bind lock.
    pub fn rebind(&self, host: &str, port: u16) -> Self {
        let (credentials, bind_lock) = if self.config.require_cached_credentials {
            (Arc::new(Mutex::new(None)), Arc::new(tokio::sync::Mutex::new(())))
        } else {
            (self.credentials.clone(), self.bind_lock.clone())
        };
        Self {
            config: self.config.clone(),
            provider: self.provider.clone(),
            target: Some((host.to_string(), port)),
            credentials,
            bind_lock,
        }
    }

    pub fn login_config_text(&self) -> String {
        let c = &self.config;
        let mut s = String::new();
        s.push_str(&format!("{} {{\n", c.jaas_client_name));
        s.push_str("  com.sun.security.auth.module.Krb5LoginModule required\n");
        s.push_str("  client=true\n");
        if c.refresh_krb5_config {
            s.push_str("  refreshKrb5Config=true\n");
        }
        if c.use_key_tab {
            s.push_str("  useKeyTab=true\n");
            if let Some(ref p) = c.key_tab_path {
                s.push_str(&format!("  keyTab=\"{}\"\n", p));
            }
        }
        if c.use_ticket_cache {
            s.push_str("  useTicketCache=true\n");
            if let Some(ref p) = c.ticket_cache_path {
                s.push_str(&format!("  ticketCache=\"{}\"\n", p));
            }
            if c.renew_tgt {
                s.push_str("  renewTGT=true\n");
            }
        }
        s.push_str(&format!("  doNotPrompt={}\n", c.require_cached_credentials));
        if !c.authentication_id.is_empty() {
            s.push_str(&format!("  principal=\"{}\"\n", c.authentication_id));
        }
        if let Some(init) = c.is_initiator {
            s.push_str(&format!("  isInitiator={}\n", init));
        }
        s.push_str(&format!("  debug={};\n", c.enable_debugging));
        s.push_str("};\n");
        s
    }

    /// Configured file, or a generated one cached per content.
    pub fn login_config_file(&self) -> Result<PathBuf> {
        match self.config.config_file_path {
            Some(ref p) => Ok(p.clone()),
            None => cached_login_config_file(&self.login_config_text()),
        }
    }

    /// Properties exported to the platform library, minus suppressed names.
    pub fn platform_properties(&self, config_file: &Path) -> BTreeMap<String, String> {
        let c = &self.config;
        let mut props = BTreeMap::new();
        if let Some(ref realm) = c.realm {
            props.insert(PROPERTY_REALM.to_string(), realm.clone());
        }
        if let Some(ref kdc) = c.kdc_address {
            props.insert(PROPERTY_KDC.to_string(), kdc.clone());
        }
        props.insert(PROPERTY_DEBUG.to_string(), c.enable_debugging.to_string());
        props.insert(PROPERTY_LOGIN_CONFIG.to_string(), config_file.display().to_string());
        props.insert(PROPERTY_USE_SUBJECT_CREDS_ONLY.to_string(), "true".to_string());
        props.insert(PROPERTY_QOP.to_string(), SaslQop::to_property_value(&c.allowed_qop));
        props.retain(|k, _| !c.suppressed_properties.iter().any(|s| s == k));
        props
    }

    fn credentials(&self, login: &LoginContext<'_>) -> Result<AcquiredCredentials> {
        let mut cached = self
            .credentials
            .lock()
            .map_err(|_| LdapError::Bind("credential cache lock poisoned".to_string()))?;
        if let Some(ref creds) = *cached {
            return Ok(creds.clone());
        }
        let creds = self.provider.acquire_credentials(login, self)?;
        debug!("Acquired Kerberos credentials for {}", creds.principal);
        *cached = Some(creds.clone());
        Ok(creds)
    }

    /// Run the full SASL exchange on `conn`.
    pub async fn bind(&self, conn: &mut LdapConnection) -> Result<LdapResult> {
        let _exclusive = self.bind_lock.lock().await;
        let config_file = self.login_config_file()?;
        let properties = self.platform_properties(&config_file);
        let login = LoginContext {
            client_name: &self.config.jaas_client_name,
            config_file: &config_file,
            properties: &properties,
        };
        let credentials = self.credentials(&login)?;
        let server_name = self
            .config
            .sasl_client_server_name
            .clone()
            .or_else(|| self.target.as_ref().map(|(h, _)| h.clone()))
            .unwrap_or_else(|| conn.host().to_string());
        let request = SaslClientRequest {
            mechanism: GSSAPI_MECHANISM,
            authorization_id: self.config.authorization_id.as_deref(),
            protocol: &self.config.service_principal_protocol,
            server_name: &server_name,
            properties: &properties,
        };
        let mut client = self.provider.new_client(&credentials, &request)?;
        debug!("Starting GSSAPI bind to {} as {}", request.service_principal(), credentials.principal);

        let mut response = client.initial_response()?;
        for _ in 0..MAX_SASL_ROUNDS {
            let step = SaslBindRequest::new(GSSAPI_MECHANISM, response.take());
            let (result, challenge) = conn.sasl_bind_step(&step).await?;
            if result.code != ResultCode::SASL_BIND_IN_PROGRESS {
                if !result.code.is_success() {
                    return Ok(result);
                }
                if !client.is_complete() {
                    if let Some(token) = challenge {
                        if client.evaluate_challenge(&token)?.is_some_and(|t| !t.is_empty()) {
                            debug!("Discarding GSSAPI token produced after the final server response");
                        }
                    }
                }
                if !client.is_complete() {
                    warn!("Server {} reported GSSAPI bind success before the exchange completed", conn.address());
                    return Err(LdapError::Bind(
                        "server reported success before the GSSAPI exchange completed".to_string(),
                    ));
                }
                return Ok(result);
            }
            response = client.evaluate_challenge(challenge.as_deref().unwrap_or(&[]))?;
        }
        warn!("GSSAPI bind to {} did not complete", conn.address());
        Err(LdapError::Bind(format!(
            "SASL exchange exceeded {} rounds",
            MAX_SASL_ROUNDS
        )))
    }
}

impl CallbackHandler for GssapiNegotiator {
    fn handle(&self, callbacks: &mut [Callback]) -> Result<()> {
        for callback in callbacks.iter_mut() {
            match callback {
                Callback::Name { answer, .. } => *answer = Some(self.config.authentication_id.clone()),
                Callback::Password { answer, .. } => match self.config.password {
                    Some(ref p) => *answer = Some(p.clone()),
                    None => {
                        return Err(LdapError::Bind(
                            "password requested during GSSAPI login but none is configured".to_string(),
                        ))
                    }
                },
                Callback::Realm {
                    default_text, answer, ..
                } => *answer = self.config.realm.clone().or_else(|| default_text.clone()),
                Callback::Language { .. } => {}
                Callback::Other(kind) => return Err(LdapError::UnsupportedCallback(kind.clone())),
            }
        }
        Ok(())
    }
}
