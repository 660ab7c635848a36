//! Client side request routing: picks a server for every outbound call,
//! keeps per server health, isolates failing instances and coordinates
//! retries across servers.

pub mod discovery;
pub mod error;
pub mod filter;
pub mod invocation;
pub mod isolation;
pub mod layer;
pub mod load_balance;
pub mod outcome;
pub mod retry;
pub mod router;
pub mod stats;
pub mod ttl;

pub use discovery::{DiscoverySnapshot, DiscoverySource, Instance, InstanceStatus, StaticDiscovery};
pub use error::{CallError, LbError};
pub use invocation::{Invocation, RoutingKey};
pub use isolation::IsolationRegistry;
pub use layer::{LoadBalance, LoadBalanceLayer};
pub use load_balance::{LoadBalancer, Rule, RuleFactory, Server};
pub use mesh_core::{LoadBalanceConfig, LoadBalanceStrategy, RoutingGranularity};
pub use outcome::{OutcomeClass, is_server_attributable_failure};
pub use retry::{RetryContext, RetryCoordinator, RetryPolicy};
pub use router::LoadBalanceRouter;
pub use stats::{LoadBalancerStats, ServerHealthStats, ServerStatsSnapshot};

pub type Result<T> = std::result::Result<T, LbError>;
