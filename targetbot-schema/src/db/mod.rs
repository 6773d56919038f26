use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::{IndexData, IndexDeclaration, Principal, PrincipalData, Secret};

mod memory;
pub use memory::*;

mod mongo;
pub use mongo::*;

pub type Result<T> = std::result::Result<T, DatabaseError>;
pub type BoxedDatabase = Box<dyn Database>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The server could not be reached, or refused the connection
    #[error("Could not connect to the database: {0}")]
    Connection(String),
    /// A principal or index is already present
    #[error("{resource} {identifier} already exists")]
    AlreadyExists {
        resource: &'static str,
        identifier: String,
    },
    /// An index with the same name or keys exists with a different specification
    #[error("Index {name} on {collection} conflicts with an existing index: {detail}")]
    IndexConflict {
        collection: String,
        name: String,
        detail: String,
    },
    /// Documents already in the collection violate the new uniqueness constraint
    #[error("Documents in {collection} violate unique index {name}: {detail}")]
    DuplicateKeyViolation {
        collection: String,
        name: String,
        detail: String,
    },
    /// A resource in the database doesn't exist
    #[error("{resource} {identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: String,
    },
    /// A resource exists, but not as declared
    #[error("{resource} {identifier} differs from its declaration: {detail}")]
    Mismatch {
        resource: &'static str,
        identifier: String,
        detail: String,
    },
    /// An unknown or internal error happened with the database
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl DatabaseError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Helper trait to reduce boilerplate
pub trait DatabaseResult<T> {
    /// Turns an `AlreadyExists` error into `Ok(None)`
    fn existing_ok(self) -> Result<Option<T>>;
}

impl<T> DatabaseResult<T> for Result<T> {
    fn existing_ok(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_already_exists() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// The database the index operations are bound to.
///
/// Obtained from [`Database::select`] and passed explicitly to every operation on that database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseContext {
    name: String,
}

impl DatabaseContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fully qualified name of a collection, e.g. `telegram_target_bot.users`
    pub fn namespace(&self, collection: &str) -> String {
        format!("{}.{}", self.name, collection)
    }
}

impl fmt::Display for DatabaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Represents a database server that the bootstrap sequence can be applied to
#[async_trait]
pub trait Database: Send + Sync {
    /// Checks that the server is reachable
    async fn ping(&self) -> Result<()>;

    /// Creates a principal in `scope`, failing with `AlreadyExists` if it's there
    async fn create_principal(
        &self,
        scope: &str,
        principal: &Principal,
        secret: &Secret,
    ) -> Result<()>;
    async fn principal(&self, scope: &str, name: &str) -> Result<PrincipalData>;

    /// Binds subsequent operations to a database. This never talks to the server.
    fn select(&self, name: &str) -> DatabaseContext {
        DatabaseContext {
            name: name.to_string(),
        }
    }

    /// Creates an index, failing with `AlreadyExists` if an identical one is there
    async fn create_index(&self, context: &DatabaseContext, index: &IndexDeclaration)
        -> Result<()>;
    /// Lists the indexes of a collection, which is empty if the collection doesn't exist
    async fn list_indexes(
        &self,
        context: &DatabaseContext,
        collection: &str,
    ) -> Result<Vec<IndexData>>;
}
