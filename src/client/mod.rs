//! Extension protocol client.
//!
//! The broker only talks to the daemon through [`ExtensionClient`] and builds
//! clients through a [`Connector`], so the wire protocol stays swappable.
//! [`SocketConnector`] is the shipped adapter over the local extension socket.

pub mod protocol;
pub mod socket;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use socket::{SocketClient, SocketConnector};

/// One result row: column name to value.
pub type Row = BTreeMap<String, String>;
pub type QueryRows = Vec<Row>;

#[async_trait]
pub trait ExtensionClient: Send + Sync {
    async fn query(&self, sql: &str) -> Result<QueryRows>;

    async fn ping(&self) -> Result<()>;

    /// Release the connection. Later calls fail with a transport error.
    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, socket: &Path, timeout: Duration) -> Result<Arc<dyn ExtensionClient>>;
}
