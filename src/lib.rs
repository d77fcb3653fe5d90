pub mod broker;
pub mod client;
pub mod clienv;
pub mod config;
pub mod error;
pub mod launch;
pub mod reply;
pub mod supervisor;

pub use broker::Broker;
pub use client::{Connector, ExtensionClient, QueryRows, Row};
pub use config::{BrokerConfig, InstanceConfig, RawInstanceConfig};
pub use error::{BrokerError, Result};
pub use reply::Reply;
pub use supervisor::{DefaultRegistry, Instance, InstanceState, InstanceStatus, ProcessExit};
