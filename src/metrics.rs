//! Pool statistics, kept as lock-free counters and rendered in the Prometheus
//! text exposition format.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Inclusive upper bounds of the checkout wait buckets, in microseconds.
/// Waits are bounded by the pool's `max_wait`, so the last bound is generous.
const WAIT_BOUNDS_MICROS: [u64; 9] = [
    1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000, 30_000_000,
];

/// Time checkouts spent parked on the wait policy. The extra slot past the
/// last bound holds waits longer than every bound.
#[derive(Debug, Default)]
struct WaitHistogram {
    slots: [AtomicU64; WAIT_BOUNDS_MICROS.len() + 1],
    total_micros: AtomicU64,
}

impl WaitHistogram {
    fn record(&self, waited: Duration) {
        let micros = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        let slot = WAIT_BOUNDS_MICROS.partition_point(|&bound| bound < micros);
        self.slots[slot].fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Cumulative counts per bound followed by the overall count.
    fn cumulative(&self) -> Vec<u64> {
        self.slots
            .iter()
            .scan(0u64, |acc, slot| {
                *acc += slot.load(Ordering::Relaxed);
                Some(*acc)
            })
            .collect()
    }

    fn render(&self, name: &str, out: &mut String) {
        let cumulative = self.cumulative();
        let bounds = WAIT_BOUNDS_MICROS
            .iter()
            .map(|&b| (b as f64 / 1_000_000.0).to_string())
            .chain(std::iter::once("+Inf".to_string()));
        for (le, n) in bounds.zip(&cumulative) {
            out.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, le, n));
        }
        let total_secs = self.total_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        out.push_str(&format!("{}_sum {}\n", name, total_secs));
        out.push_str(&format!("{}_count {}\n", name, cumulative.last().copied().unwrap_or(0)));
    }
}

/// Counters updated by the pool (thread-safe, lock-free).
#[derive(Debug, Default)]
pub struct PoolStatistics {
    connections_created: AtomicU64,
    failed_connection_attempts: AtomicU64,
    closed_defunct: AtomicU64,
    closed_expired: AtomicU64,
    closed_unneeded: AtomicU64,
    checkouts_success: AtomicU64,
    checkouts_waited: AtomicU64,
    checkouts_failed: AtomicU64,
    releases_valid: AtomicU64,
    releases_invalid: AtomicU64,
    health_check_runs: AtomicU64,
    replacement_failures: AtomicU64,
    checkout_wait: WaitHistogram,
}

/// Point-in-time copy of [`PoolStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatisticsSnapshot {
    pub connections_created: u64,
    pub failed_connection_attempts: u64,
    pub closed_defunct: u64,
    pub closed_expired: u64,
    pub closed_unneeded: u64,
    pub checkouts_success: u64,
    pub checkouts_waited: u64,
    pub checkouts_failed: u64,
    pub releases_valid: u64,
    pub releases_invalid: u64,
    pub health_check_runs: u64,
    pub replacement_failures: u64,
}

impl PoolStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connections_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_failed_connection_attempts(&self) {
        self.failed_connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_closed_defunct(&self) {
        self.closed_defunct.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_closed_expired(&self) {
        self.closed_expired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_closed_unneeded(&self) {
        self.closed_unneeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful checkout; `waited` is the time spent blocked on the wait policy.
    pub fn record_checkout(&self, waited: Option<Duration>) {
        self.checkouts_success.fetch_add(1, Ordering::Relaxed);
        if let Some(waited) = waited {
            self.checkouts_waited.fetch_add(1, Ordering::Relaxed);
            self.checkout_wait.record(waited);
        }
    }

    #[inline]
    pub fn inc_checkouts_failed(&self) {
        self.checkouts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self, valid: bool) {
        if valid {
            self.releases_valid.fetch_add(1, Ordering::Relaxed);
        } else {
            self.releases_invalid.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn inc_health_check_runs(&self) {
        self.health_check_runs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_replacement_failures(&self) {
        self.replacement_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatisticsSnapshot {
        PoolStatisticsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            failed_connection_attempts: self.failed_connection_attempts.load(Ordering::Relaxed),
            closed_defunct: self.closed_defunct.load(Ordering::Relaxed),
            closed_expired: self.closed_expired.load(Ordering::Relaxed),
            closed_unneeded: self.closed_unneeded.load(Ordering::Relaxed),
            checkouts_success: self.checkouts_success.load(Ordering::Relaxed),
            checkouts_waited: self.checkouts_waited.load(Ordering::Relaxed),
            checkouts_failed: self.checkouts_failed.load(Ordering::Relaxed),
            releases_valid: self.releases_valid.load(Ordering::Relaxed),
            releases_invalid: self.releases_invalid.load(Ordering::Relaxed),
            health_check_runs: self.health_check_runs.load(Ordering::Relaxed),
            replacement_failures: self.replacement_failures.load(Ordering::Relaxed),
        }
    }

    /// Render in the Prometheus text format.
    /// `candidate_states`: (address, is_up) for every server the pool has seen.
    pub fn render_prometheus(
        &self,
        current_size: usize,
        available: usize,
        candidate_states: &[(String, bool)],
    ) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        for (name, help, val) in [
            ("connections_created_total", "Connections opened by the pool.", s.connections_created),
            (
                "failed_connection_attempts_total",
                "Attempts to open a pooled connection that failed.",
                s.failed_connection_attempts,
            ),
            ("checkouts_total", "Successful checkouts.", s.checkouts_success),
            ("checkouts_waited_total", "Checkouts that had to wait for a connection.", s.checkouts_waited),
            ("checkouts_failed_total", "Checkouts that failed.", s.checkouts_failed),
            ("health_check_runs_total", "Background health check sweeps.", s.health_check_runs),
            (
                "replacement_failures_total",
                "Failed attempts to replace a defunct connection.",
                s.replacement_failures,
            ),
        ] {
            out.push_str(&format!("# HELP ldap_pool_{} {}\n", name, help));
            out.push_str(&format!("# TYPE ldap_pool_{} counter\n", name));
            out.push_str(&format!("ldap_pool_{} {}\n", name, val));
        }

        out.push_str("# HELP ldap_pool_connections_closed_total Connections closed by the pool, by reason.\n");
        out.push_str("# TYPE ldap_pool_connections_closed_total counter\n");
        for (reason, val) in [
            ("defunct", s.closed_defunct),
            ("expired", s.closed_expired),
            ("unneeded", s.closed_unneeded),
        ] {
            out.push_str(&format!("ldap_pool_connections_closed_total{{reason=\"{}\"}} {}\n", reason, val));
        }

        out.push_str("# HELP ldap_pool_releases_total Connections released back to the pool.\n");
        out.push_str("# TYPE ldap_pool_releases_total counter\n");
        out.push_str(&format!("ldap_pool_releases_total{{valid=\"true\"}} {}\n", s.releases_valid));
        out.push_str(&format!("ldap_pool_releases_total{{valid=\"false\"}} {}\n", s.releases_invalid));

        out.push_str("# HELP ldap_pool_connections Connections currently held by the pool.\n");
        out.push_str("# TYPE ldap_pool_connections gauge\n");
        out.push_str(&format!("ldap_pool_connections {}\n", current_size));
        out.push_str("# HELP ldap_pool_available_connections Connections ready for checkout.\n");
        out.push_str("# TYPE ldap_pool_available_connections gauge\n");
        out.push_str(&format!("ldap_pool_available_connections {}\n", available));

        out.push_str("# HELP ldap_pool_server_up Server state seen by the pool: 1 = up, 0 = down.\n");
        out.push_str("# TYPE ldap_pool_server_up gauge\n");
        for (address, up) in candidate_states {
            let escaped = address.replace('\\', "\\\\").replace('"', "\\\"");
            out.push_str(&format!("ldap_pool_server_up{{server=\"{}\"}} {}\n", escaped, u8::from(*up)));
        }

        out.push_str("# HELP ldap_pool_checkout_wait_seconds Time spent waiting for a connection.\n");
        out.push_str("# TYPE ldap_pool_checkout_wait_seconds histogram\n");
        self.checkout_wait.render("ldap_pool_checkout_wait_seconds", &mut out);

        out
    }
}

impl fmt::Display for PoolStatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} failed_attempts={} checkouts={} waited={} checkout_failures={} \
             releases={}/{} closed(defunct={} expired={} unneeded={}) sweeps={} replacement_failures={}",
            self.connections_created,
            self.failed_connection_attempts,
            self.checkouts_success,
            self.checkouts_waited,
            self.checkouts_failed,
            self.releases_valid,
            self.releases_invalid,
            self.closed_defunct,
            self.closed_expired,
            self.closed_unneeded,
            self.health_check_runs,
            self.replacement_failures,
        )
    }
}
