//! Failover server sets.
//!
//! Candidates come from a static list or from service records resolved through
//! a pluggable [`ServiceRecordResolver`]. Resolved records are cached until the
//! TTL runs out and re-resolved on the next use after that. Candidates are tried
//! by ascending priority; equal priorities are ordered by weighted random
//! selection (RFC 2782).

use crate::bind::BindSpec;
use crate::connection::{ConnectionOptions, LdapConnection};
use crate::error::{CandidateFailure, LdapError, Result};
use crate::health_check::HealthCheck;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Candidate health as last observed: 0 = Up, 1 = Down.
const NODE_UP: u8 = 0;
const NODE_DOWN: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCandidate {
    pub host: String,
    pub port: u16,
    /// Lower is preferred.
    pub priority: u16,
    pub weight: u16,
    pub use_tls: bool,
    /// When the record this candidate came from stops being valid.
    pub expires_at: Option<Instant>,
}

impl ServerCandidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority: 0,
            weight: 0,
            use_tls: false,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u16) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One service record: (priority, weight, port, target).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedRecords {
    pub records: Vec<SrvRecord>,
    pub ttl: Duration,
}

#[async_trait]
pub trait ServiceRecordResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<ResolvedRecords>;
}

/// Resolver that always answers with a fixed record set.
#[derive(Debug)]
pub struct StaticRecordResolver {
    records: Vec<SrvRecord>,
    ttl: Duration,
    lookups: AtomicUsize,
}

impl StaticRecordResolver {
    pub fn new(records: Vec<SrvRecord>, ttl: Duration) -> Self {
        Self {
            records,
            ttl,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ServiceRecordResolver for StaticRecordResolver {
    async fn resolve(&self, name: &str) -> Result<ResolvedRecords> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        debug!("Resolved {} to {} static records", name, self.records.len());
        Ok(ResolvedRecords {
            records: self.records.clone(),
            ttl: self.ttl,
        })
    }
}

struct CachedCandidates {
    candidates: Vec<ServerCandidate>,
    expires_at: Instant,
}

enum CandidateSource {
    Static(Vec<ServerCandidate>),
    Service {
        name: String,
        resolver: Arc<dyn ServiceRecordResolver>,
        use_tls: bool,
        cache: ArcSwapOption<CachedCandidates>,
        refresh: tokio::sync::Mutex<()>,
    },
}

/// Sort by priority, then shuffle each priority group by weight.
pub fn order_candidates<R: Rng>(mut candidates: Vec<ServerCandidate>, rng: &mut R) -> Vec<ServerCandidate> {
    candidates.sort_by_key(|c| c.priority);
    let mut ordered = Vec::with_capacity(candidates.len());
    let mut rest = candidates.into_iter().peekable();
    while let Some(first) = rest.next() {
        let priority = first.priority;
        let mut group = vec![first];
        while let Some(next) = rest.next_if(|c| c.priority == priority) {
            group.push(next);
        }
        ordered.extend(weighted_shuffle(group, rng));
    }
    ordered
}

/// Selection probability is proportional to weight. Zero-weight candidates
/// follow the weighted ones and keep their relative order.
fn weighted_shuffle<R: Rng>(mut group: Vec<ServerCandidate>, rng: &mut R) -> Vec<ServerCandidate> {
    let mut out = Vec::with_capacity(group.len());
    while !group.is_empty() {
        let total: u32 = group.iter().map(|c| c.weight as u32).sum();
        let pick = if total == 0 { 0 } else { rng.gen_range(1..=total) };
        let mut running = 0u32;
        let idx = group
            .iter()
            .position(|c| {
                running += c.weight as u32;
                running >= pick
            })
            .unwrap_or(0);
        out.push(group.remove(idx));
    }
    out
}

#[derive(Default)]
struct Attempts {
    failures: Vec<CandidateFailure>,
    in_flight: Option<(String, u16)>,
    resolving: bool,
}

pub struct ServerSet {
    source: CandidateSource,
    options: ConnectionOptions,
    bind: Option<BindSpec>,
    overall_timeout: Option<Duration>,
    states: DashMap<String, u8>,
}

impl std::fmt::Debug for ServerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            CandidateSource::Static(c) => format!("static({})", c.len()),
            CandidateSource::Service { name, .. } => format!("service({})", name),
        };
        f.debug_struct("ServerSet")
            .field("source", &source)
            .field("overall_timeout", &self.overall_timeout)
            .field("bind", &self.bind.is_some())
            .finish()
    }
}

impl ServerSet {
    pub fn new_static(candidates: Vec<ServerCandidate>, options: ConnectionOptions) -> Self {
        Self::with_source(CandidateSource::Static(candidates), options)
    }

    pub fn from_service_records(
        name: impl Into<String>,
        resolver: Arc<dyn ServiceRecordResolver>,
        use_tls: bool,
        options: ConnectionOptions,
    ) -> Self {
        Self::with_source(
            CandidateSource::Service {
                name: name.into(),
                resolver,
                use_tls,
                cache: ArcSwapOption::empty(),
                refresh: tokio::sync::Mutex::new(()),
            },
            options,
        )
    }

    fn with_source(source: CandidateSource, options: ConnectionOptions) -> Self {
        Self {
            source,
            options,
            bind: None,
            overall_timeout: None,
            states: DashMap::new(),
        }
    }

    /// Authenticate each new connection before it is returned.
    pub fn with_bind(mut self, bind: BindSpec) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Bound the whole failover pass, across all candidates.
    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Last observed state per candidate address, `true` when up.
    pub fn candidate_states(&self) -> Vec<(String, bool)> {
        let mut out: Vec<(String, bool)> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), *e.value() == NODE_UP))
            .collect();
        out.sort();
        out
    }

    /// Current candidate list, re-resolving service records when the cache expired.
    pub async fn candidates(&self) -> Result<Vec<ServerCandidate>> {
        match &self.source {
            CandidateSource::Static(c) => Ok(c.clone()),
            CandidateSource::Service {
                name,
                resolver,
                use_tls,
                cache,
                refresh,
            } => {
                if let Some(cached) = cache.load_full() {
                    if Instant::now() < cached.expires_at {
                        return Ok(cached.candidates.clone());
                    }
                }
                let _guard = refresh.lock().await;
                // another caller may have refreshed while we waited
                if let Some(cached) = cache.load_full() {
                    if Instant::now() < cached.expires_at {
                        return Ok(cached.candidates.clone());
                    }
                }
                let resolved = resolver.resolve(name).await?;
                let expires_at = Instant::now() + resolved.ttl;
                let candidates: Vec<ServerCandidate> = resolved
                    .records
                    .into_iter()
                    .map(|r| ServerCandidate {
                        host: r.target.trim_end_matches('.').to_string(),
                        port: r.port,
                        priority: r.priority,
                        weight: r.weight,
                        use_tls: *use_tls,
                        expires_at: Some(expires_at),
                    })
                    .collect();
                debug!("Service {} resolved to {} candidates (ttl {:?})", name, candidates.len(), resolved.ttl);
                cache.store(Some(Arc::new(CachedCandidates {
                    candidates: candidates.clone(),
                    expires_at,
                })));
                Ok(candidates)
            }
        }
    }

    pub async fn ordered_candidates(&self) -> Result<Vec<ServerCandidate>> {
        let candidates = self.candidates().await?;
        Ok(order_candidates(candidates, &mut rand::thread_rng()))
    }

    /// Connect to the first usable candidate. Each candidate gets the connect
    /// timeout; bind and the optional health check run before it is accepted.
    /// The overall timeout covers candidate resolution as well as the connect pass.
    pub async fn get_connection(&self, health_check: Option<&dyn HealthCheck>) -> Result<LdapConnection> {
        let mut attempts = Attempts::default();
        let outcome = {
            let pass = self.resolve_and_connect(health_check, &mut attempts);
            match self.overall_timeout {
                Some(limit) => tokio::time::timeout(limit, pass).await.ok(),
                None => Some(pass.await),
            }
        };
        match outcome {
            Some(result) => result,
            None => {
                let limit = self.overall_timeout.unwrap_or_default();
                let failure = if attempts.resolving {
                    warn!("Failover deadline of {:?} exceeded while resolving {}", limit, self.source_name());
                    CandidateFailure {
                        host: self.source_name().to_string(),
                        port: 0,
                        cause: format!("deadline exceeded after {:?} while resolving candidates", limit),
                    }
                } else {
                    let (host, port) = attempts.in_flight.take().unwrap_or_else(|| ("*".to_string(), 0));
                    warn!("Failover deadline of {:?} exceeded while trying {}:{}", limit, host, port);
                    CandidateFailure {
                        host,
                        port,
                        cause: format!("deadline exceeded after {:?}", limit),
                    }
                };
                attempts.failures.push(failure);
                Err(LdapError::ServerSetUnavailable(attempts.failures))
            }
        }
    }

    async fn resolve_and_connect(
        &self,
        health_check: Option<&dyn HealthCheck>,
        attempts: &mut Attempts,
    ) -> Result<LdapConnection> {
        attempts.resolving = true;
        let candidates = self.ordered_candidates().await?;
        attempts.resolving = false;
        if candidates.is_empty() {
            return Err(LdapError::ServerSetUnavailable(Vec::new()));
        }
        match self.try_candidates(&candidates, health_check, attempts).await {
            Some(conn) => Ok(conn),
            None => Err(LdapError::ServerSetUnavailable(std::mem::take(&mut attempts.failures))),
        }
    }

    fn source_name(&self) -> &str {
        match &self.source {
            CandidateSource::Static(_) => "*",
            CandidateSource::Service { name, .. } => name,
        }
    }

    async fn try_candidates(
        &self,
        candidates: &[ServerCandidate],
        health_check: Option<&dyn HealthCheck>,
        attempts: &mut Attempts,
    ) -> Option<LdapConnection> {
        for candidate in candidates {
            attempts.in_flight = Some((candidate.host.clone(), candidate.port));
            match self.connect_candidate(candidate, health_check).await {
                Ok(conn) => {
                    self.mark(candidate, true, None);
                    return Some(conn);
                }
                Err(e) => {
                    self.mark(candidate, false, Some(&e));
                    attempts.failures.push(CandidateFailure {
                        host: candidate.host.clone(),
                        port: candidate.port,
                        cause: e.to_string(),
                    });
                }
            }
            attempts.in_flight = None;
        }
        None
    }

    async fn connect_candidate(
        &self,
        candidate: &ServerCandidate,
        health_check: Option<&dyn HealthCheck>,
    ) -> Result<LdapConnection> {
        let options = if candidate.use_tls {
            if self.options.tls.is_none() {
                return Err(LdapError::Tls(format!(
                    "no TLS client configuration for {}",
                    candidate.address()
                )));
            }
            self.options.clone()
        } else {
            ConnectionOptions {
                tls: None,
                ..self.options.clone()
            }
        };
        let mut conn = LdapConnection::connect(&candidate.host, candidate.port, &options).await?;
        if let Some(ref bind) = self.bind {
            if let Err(e) = bind.bind(&mut conn).await {
                conn.close().await;
                return Err(e);
            }
        }
        if let Some(check) = health_check {
            if let Err(e) = check.ensure_new_connection_valid(&mut conn).await {
                conn.close().await;
                return Err(e);
            }
        }
        Ok(conn)
    }

    fn mark(&self, candidate: &ServerCandidate, up: bool, cause: Option<&LdapError>) {
        let new_state = if up { NODE_UP } else { NODE_DOWN };
        let was = self.states.insert(candidate.address(), new_state);
        match (was, up) {
            (Some(NODE_DOWN), true) => info!("Server {} is up", candidate.address()),
            (Some(NODE_UP) | None, false) => warn!(
                "Server {} is down: {}",
                candidate.address(),
                cause.map(|e| e.to_string()).unwrap_or_default()
            ),
            _ => {}
        }
    }
}
