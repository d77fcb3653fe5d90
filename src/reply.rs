//! Uniform result envelope returned by every query.

use crate::client::QueryRows;
use crate::error::BrokerError;
use serde::{Serialize, Serializer};

/// Result of a query: rows or an error, never raised across the boundary.
///
/// Callers inspect [`Reply::error`] first; when it is `None` the value holds
/// the rows the daemon returned.
#[derive(Debug, Serialize)]
pub struct Reply {
    value: Option<QueryRows>,
    #[serde(serialize_with = "serialize_error")]
    error: Option<BrokerError>,
}

impl Reply {
    pub fn new(value: Option<QueryRows>, error: Option<BrokerError>) -> Self {
        Self { value, error }
    }

    pub fn ok(rows: QueryRows) -> Self {
        Self::new(Some(rows), None)
    }

    pub fn err(error: BrokerError) -> Self {
        Self::new(None, Some(error))
    }

    pub fn value(&self) -> Option<&QueryRows> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&BrokerError> {
        self.error.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<QueryRows, BrokerError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.value.unwrap_or_default()),
        }
    }
}

impl From<Result<QueryRows, BrokerError>> for Reply {
    fn from(result: Result<QueryRows, BrokerError>) -> Self {
        match result {
            Ok(rows) => Reply::ok(rows),
            Err(e) => Reply::err(e),
        }
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<BrokerError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}
