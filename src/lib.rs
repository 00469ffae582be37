pub mod ber;
pub mod bind;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod gssapi;
pub mod health_check;
pub mod ldap_protocol;
pub mod matching;
pub mod metrics;
pub mod pool;
pub mod server_set;
pub mod tls;

#[cfg(test)]
pub(crate) mod test_support;

pub use ber::{BerElement, BerWriter, DecodeError};
pub use bind::{BindSpec, SimpleBindPolicy};
pub use config::Config;
pub use connection::{ConnectionOptions, LdapConnection};
pub use error::{CandidateFailure, LdapError, Result, ResultCode};
pub use filter::Filter;
pub use gssapi::{GssapiBindConfig, GssapiNegotiator, SecurityContextProvider};
pub use health_check::{AggregateHealthCheck, GetEntryHealthCheck, HealthCheck, WhoAmIHealthCheck};
pub use ldap_protocol::{AddRequest, Attribute, Control, Entry, Modification, ModificationType, ModifyRequest, Request};
pub use metrics::PoolStatistics;
pub use pool::{HealthCheckResult, LdapConnectionPool, PoolOptions, PooledConnection};
pub use server_set::{ServerCandidate, ServerSet, ServiceRecordResolver, StaticRecordResolver};
