//! Connection health checks used by server sets and pools.
//!
//! A health check is consulted at four points in a connection's life. Every
//! hook defaults to "healthy", so a check only overrides what it cares about.

use crate::connection::LdapConnection;
use crate::error::{LdapError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_RESPONSE_TIME: Duration = Duration::from_secs(5);

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// After connect and bind, before the connection is handed out.
    async fn ensure_new_connection_valid(&self, _conn: &mut LdapConnection) -> Result<()> {
        Ok(())
    }

    async fn ensure_connection_valid_for_checkout(&self, _conn: &mut LdapConnection) -> Result<()> {
        Ok(())
    }

    async fn ensure_connection_valid_for_release(&self, _conn: &mut LdapConnection) -> Result<()> {
        Ok(())
    }

    /// Background sweep check for idle connections.
    async fn ensure_connection_valid_for_continued_use(&self, _conn: &mut LdapConnection) -> Result<()> {
        Ok(())
    }
}

/// Which hooks a shipped check runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckPhases {
    pub on_create: bool,
    pub on_checkout: bool,
    pub on_release: bool,
    pub background: bool,
}

impl Default for HealthCheckPhases {
    fn default() -> Self {
        Self {
            on_create: true,
            on_checkout: false,
            on_release: false,
            background: true,
        }
    }
}

fn failure(conn: &LdapConnection, msg: impl std::fmt::Display) -> LdapError {
    LdapError::HealthCheckFailure(format!("{}: {}", conn.address(), msg))
}

/// Healthy when a base search for `entry_dn` returns the entry in time.
#[derive(Debug, Clone)]
pub struct GetEntryHealthCheck {
    pub entry_dn: String,
    pub max_response_time: Duration,
    pub phases: HealthCheckPhases,
}

impl GetEntryHealthCheck {
    pub fn new(entry_dn: impl Into<String>) -> Self {
        Self {
            entry_dn: entry_dn.into(),
            max_response_time: DEFAULT_MAX_RESPONSE_TIME,
            phases: HealthCheckPhases::default(),
        }
    }

    pub fn with_max_response_time(mut self, max_response_time: Duration) -> Self {
        self.max_response_time = max_response_time;
        self
    }

    pub fn with_phases(mut self, phases: HealthCheckPhases) -> Self {
        self.phases = phases;
        self
    }

    async fn check(&self, conn: &mut LdapConnection) -> Result<()> {
        match tokio::time::timeout(self.max_response_time, conn.get_entry(&self.entry_dn, &["1.1"])).await {
            Ok(Ok(Some(_))) => Ok(()),
            Ok(Ok(None)) => Err(failure(conn, format!("entry '{}' does not exist", self.entry_dn))),
            Ok(Err(e)) => Err(failure(conn, format!("retrieving '{}' failed: {}", self.entry_dn, e))),
            Err(_) => Err(failure(
                conn,
                format!("retrieving '{}' took longer than {:?}", self.entry_dn, self.max_response_time),
            )),
        }
    }
}

#[async_trait]
impl HealthCheck for GetEntryHealthCheck {
    async fn ensure_new_connection_valid(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.phases.on_create {
            self.check(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_checkout(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.phases.on_checkout {
            self.check(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_release(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.phases.on_release {
            self.check(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_continued_use(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.phases.background {
            self.check(conn).await?;
        }
        Ok(())
    }
}

/// Healthy when the "Who am I?" extended operation succeeds in time.
#[derive(Debug, Clone)]
pub struct WhoAmIHealthCheck {
    pub max_response_time: Duration,
    pub phases: HealthCheckPhases,
}

impl Default for WhoAmIHealthCheck {
    fn default() -> Self {
        Self {
            max_response_time: DEFAULT_MAX_RESPONSE_TIME,
            phases: HealthCheckPhases::default(),
        }
    }
}

impl WhoAmIHealthCheck {
    async fn check(&self, conn: &mut LdapConnection) -> Result<()> {
        match tokio::time::timeout(self.max_response_time, conn.who_am_i()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(failure(conn, format!("who am i failed: {}", e))),
            Err(_) => Err(failure(conn, format!("who am i took longer than {:?}", self.max_response_time))),
        }
    }
}

#[async_trait]
impl HealthCheck for WhoAmIHealthCheck {
    async fn ensure_new_connection_valid(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.phases.on_create {
            self.check(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_checkout(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.phases.on_checkout {
            self.check(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_release(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.phases.on_release {
            self.check(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_continued_use(&self, conn: &mut LdapConnection) -> Result<()> {
        if self.phases.background {
            self.check(conn).await?;
        }
        Ok(())
    }
}

/// Runs every inner check in order; the first failure wins.
#[derive(Clone, Default)]
pub struct AggregateHealthCheck {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl AggregateHealthCheck {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self { checks }
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

#[async_trait]
impl HealthCheck for AggregateHealthCheck {
    async fn ensure_new_connection_valid(&self, conn: &mut LdapConnection) -> Result<()> {
        for c in &self.checks {
            c.ensure_new_connection_valid(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_checkout(&self, conn: &mut LdapConnection) -> Result<()> {
        for c in &self.checks {
            c.ensure_connection_valid_for_checkout(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_release(&self, conn: &mut LdapConnection) -> Result<()> {
        for c in &self.checks {
            c.ensure_connection_valid_for_release(conn).await?;
        }
        Ok(())
    }

    async fn ensure_connection_valid_for_continued_use(&self, conn: &mut LdapConnection) -> Result<()> {
        for c in &self.checks {
            c.ensure_connection_valid_for_continued_use(conn).await?;
        }
        Ok(())
    }
}
