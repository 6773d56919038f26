use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use log::debug;
use mongodb::{
    bson::{doc, from_document, Document},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{ClientOptions, IndexOptions},
    Client, IndexModel,
};
use serde::Deserialize;

use crate::{
    Database, DatabaseContext, DatabaseError, IndexData, IndexDeclaration, KeySpec, Principal,
    PrincipalData, Result, Secret,
};

/// Server error codes the bootstrap sequence tells apart
mod code {
    pub const UNAUTHORIZED: i32 = 13;
    pub const AUTHENTICATION_FAILED: i32 = 18;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const INDEX_ALREADY_EXISTS: i32 = 68;
    pub const INDEX_OPTIONS_CONFLICT: i32 = 85;
    pub const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
    pub const DUPLICATE_KEY: i32 = 11000;
    pub const USER_ALREADY_EXISTS: i32 = 51003;
}

/// A MongoDB implementation of the bootstrap target
pub struct MongoDatabase {
    client: Client,
}

impl MongoDatabase {
    /// Builds a client. No connection is made until the first operation.
    pub async fn connect(uri: &str, server_selection_timeout: Duration) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await.map_err(connect_error)?;

        options.server_selection_timeout = Some(server_selection_timeout);
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());

        let client = Client::with_options(options).map_err(connect_error)?;

        Ok(Self { client })
    }

    async fn index_by_name(
        &self,
        context: &DatabaseContext,
        collection: &str,
        name: &str,
    ) -> Result<Option<IndexData>> {
        let indexes = self.list_indexes(context, collection).await?;

        Ok(indexes.into_iter().find(|i| i.name == name))
    }
}

#[async_trait]
impl Database for MongoDatabase {
    async fn ping(&self) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn create_principal(
        &self,
        scope: &str,
        principal: &Principal,
        secret: &Secret,
    ) -> Result<()> {
        let roles: Vec<Document> = principal
            .grants
            .iter()
            .map(|g| doc! { "role": g.role.as_str(), "db": g.database.as_str() })
            .collect();

        let command = doc! {
            "createUser": principal.name.as_str(),
            "pwd": secret.expose(),
            "roles": roles,
        };

        self.client
            .database(scope)
            .run_command(command)
            .await
            .map_err(|e| principal_error(e, format!("{}@{}", principal.name, scope)))
            .map(|_| ())
    }

    async fn principal(&self, scope: &str, name: &str) -> Result<PrincipalData> {
        let response = self
            .client
            .database(scope)
            .run_command(doc! { "usersInfo": { "user": name, "db": scope } })
            .await
            .map_err(|e| e.any())?;

        let reply: UsersInfoReply =
            from_document(response).map_err(|e| DatabaseError::Internal(Box::new(e)))?;

        reply
            .users
            .into_iter()
            .next()
            .ok_or_else(|| DatabaseError::NotFound {
                resource: "principal",
                identifier: format!("{}@{}", name, scope),
            })
    }

    async fn create_index(
        &self,
        context: &DatabaseContext,
        index: &IndexDeclaration,
    ) -> Result<()> {
        let name = index.name();

        // The server accepts an identical index silently, so look first to report it
        if let Some(existing) = self
            .index_by_name(context, &index.collection, &name)
            .await?
        {
            if index.is_satisfied_by(&existing) {
                return Err(DatabaseError::AlreadyExists {
                    resource: "index",
                    identifier: format!("{} on {}", name, context.namespace(&index.collection)),
                });
            }
        }

        let options = IndexOptions::builder()
            .name(name.clone())
            .unique(index.unique)
            .expire_after(index.expire_after)
            .build();

        let model = IndexModel::builder()
            .keys(index.keys.to_document())
            .options(options)
            .build();

        self.client
            .database(context.name())
            .collection::<Document>(&index.collection)
            .create_index(model)
            .await
            .map_err(|e| index_error(e, context.namespace(&index.collection), name))
            .map(|_| ())
    }

    async fn list_indexes(
        &self,
        context: &DatabaseContext,
        collection: &str,
    ) -> Result<Vec<IndexData>> {
        let result = self
            .client
            .database(context.name())
            .collection::<Document>(collection)
            .list_indexes()
            .await;

        let cursor = match result {
            Ok(cursor) => cursor,
            Err(e) if is_missing_namespace(&e) => return Ok(vec![]),
            Err(e) => return Err(e.any()),
        };

        let models: Vec<IndexModel> = cursor.try_collect().await.map_err(|e| e.any())?;

        Ok(models.into_iter().filter_map(index_data).collect())
    }
}

#[derive(Debug, Deserialize)]
struct UsersInfoReply {
    users: Vec<PrincipalData>,
}

fn index_data(model: IndexModel) -> Option<IndexData> {
    let Some(keys) = KeySpec::from_document(&model.keys) else {
        debug!("Skipping index with unsupported keys {}", model.keys);
        return None;
    };

    let options = model.options.unwrap_or_default();

    Some(IndexData {
        name: options.name.unwrap_or_else(|| keys.index_name()),
        unique: options.unique.unwrap_or(false),
        expire_after: options.expire_after,
        sparse: options.sparse.unwrap_or(false),
        partial_filter: options.partial_filter_expression,
        keys,
    })
}

fn principal_error(error: MongoError, identifier: String) -> DatabaseError {
    match server_code(&error) {
        // Older servers report an existing user as a duplicate key
        Some(code::USER_ALREADY_EXISTS) | Some(code::DUPLICATE_KEY) => {
            DatabaseError::AlreadyExists {
                resource: "principal",
                identifier,
            }
        }
        _ => error.any(),
    }
}

fn index_error(error: MongoError, collection: String, name: String) -> DatabaseError {
    match server_code(&error) {
        Some(code::DUPLICATE_KEY) => DatabaseError::DuplicateKeyViolation {
            collection,
            name,
            detail: error.to_string(),
        },
        Some(code::INDEX_ALREADY_EXISTS)
        | Some(code::INDEX_OPTIONS_CONFLICT)
        | Some(code::INDEX_KEY_SPECS_CONFLICT) => DatabaseError::IndexConflict {
            collection,
            name,
            detail: error.to_string(),
        },
        _ => error.any(),
    }
}

fn is_missing_namespace(error: &MongoError) -> bool {
    server_code(error) == Some(code::NAMESPACE_NOT_FOUND)
}

/// A bad connection string only counts as a connection error while setting up the client
fn connect_error(error: MongoError) -> DatabaseError {
    match error.kind.as_ref() {
        ErrorKind::InvalidArgument { .. } => DatabaseError::Connection(error.to_string()),
        _ => error.any(),
    }
}

/// The error code the server replied with, if it replied at all
fn server_code(error: &MongoError) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(e) => Some(e.code),
        ErrorKind::Write(WriteFailure::WriteError(e)) => Some(e.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(e)) => Some(e.code),
        _ => None,
    }
}

fn is_connection_error(error: &MongoError) -> bool {
    let refused = matches!(
        server_code(error),
        Some(code::UNAUTHORIZED) | Some(code::AUTHENTICATION_FAILED)
    );

    refused
        || matches!(
            error.kind.as_ref(),
            ErrorKind::ServerSelection { .. }
                | ErrorKind::Io(_)
                | ErrorKind::DnsResolve { .. }
                | ErrorKind::ConnectionPoolCleared { .. }
                | ErrorKind::Authentication { .. }
        )
}

/// Helper trait to reduce boilerplate
trait IntoDatabaseError {
    fn any(self) -> DatabaseError;
}

impl IntoDatabaseError for MongoError {
    fn any(self) -> DatabaseError {
        if is_connection_error(&self) {
            DatabaseError::Connection(self.to_string())
        } else {
            DatabaseError::Internal(Box::new(self))
        }
    }
}
