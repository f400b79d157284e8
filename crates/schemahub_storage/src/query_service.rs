use async_trait::async_trait;
#[cfg(any(feature = "testing", test))]
use mockall::automock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryServiceError {
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("Query service backend error: {0}")]
    Backend(String),
}

pub type QueryServiceResult<T> = Result<T, QueryServiceError>;

/// Rows come back as strings, the way a serverless SQL service returns them;
/// callers parse the columns they asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOutput {
    pub rows: Vec<Vec<String>>,
}

/// The columnar query boundary used by the dedupe engine. Statements either
/// return rows (aggregations) or materialize results to an object-store
/// location named inside the statement (CTAS rewrites).
#[cfg_attr(any(feature = "testing", test), automock)]
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn execute(&self, sql: &str) -> QueryServiceResult<QueryOutput>;
}
