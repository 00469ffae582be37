//! Bind policies and the per-connection bind step used by server sets.

use crate::connection::LdapConnection;
use crate::error::{LdapError, Result};
use crate::gssapi::GssapiNegotiator;
use crate::ldap_protocol::{LdapResult, SimpleBindRequest};
use tracing::debug;

/// Client-side checks applied before a simple bind is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleBindPolicy {
    /// Forward binds with a DN but no password. Many servers treat those as
    /// unauthenticated binds and report success.
    pub allow_empty_password: bool,
}

impl SimpleBindPolicy {
    pub fn check(&self, request: &SimpleBindRequest) -> Result<()> {
        if request.is_anonymous() {
            return Ok(());
        }
        if request.password.is_empty() && !self.allow_empty_password {
            return Err(LdapError::BindParameter(format!(
                "simple bind for '{}' has an empty password",
                request.dn
            )));
        }
        Ok(())
    }
}

/// Check the policy, then send the bind.
pub async fn simple_bind(
    conn: &mut LdapConnection,
    request: &SimpleBindRequest,
    policy: SimpleBindPolicy,
) -> Result<LdapResult> {
    policy.check(request)?;
    conn.simple_bind(request).await
}

/// How each freshly opened connection is authenticated.
#[derive(Clone, Debug)]
pub enum BindSpec {
    Simple {
        request: SimpleBindRequest,
        policy: SimpleBindPolicy,
    },
    Gssapi(GssapiNegotiator),
}

impl BindSpec {
    pub fn simple(dn: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        BindSpec::Simple {
            request: SimpleBindRequest::new(dn, password),
            policy: SimpleBindPolicy::default(),
        }
    }

    pub async fn bind(&self, conn: &mut LdapConnection) -> Result<()> {
        match self {
            BindSpec::Simple { request, policy } => {
                simple_bind(conn, request, *policy).await?;
            }
            BindSpec::Gssapi(negotiator) => {
                negotiator.rebind(conn.host(), conn.port()).bind(conn).await?;
            }
        }
        debug!("Bound connection to {}", conn.address());
        Ok(())
    }
}
