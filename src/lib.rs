pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod monitoring;
pub mod selector;
pub mod shutdown;
pub mod store;
pub mod supervisor;

pub use config::{Config, ConfigManager, VirtualHostConfig};
pub use controller::{VirtualHostController, VirtualHostStatus};
pub use error::{RedirectorError, RedirectorResult};
pub use health::{HealthProbe, ProbeOutcome, Prober};
pub use monitoring::MetricsCollector;
pub use selector::SelectionStrategy;
pub use store::{ManagedEntry, SharedHostsStore};
pub use supervisor::Supervisor;
