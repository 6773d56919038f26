use std::collections::HashMap;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};
use parking_lot::Mutex;

use crate::{
    Database, DatabaseContext, DatabaseError, IndexData, IndexDeclaration, KeySpec, Principal,
    PrincipalData, Result, RoleGrant, Secret,
};

/// An in-memory stand-in for a server, enforcing unique indexes on inserted documents.
///
/// Used to preview a bootstrap without connecting, and to test the sequence.
#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
    unreachable: bool,
}

#[derive(Default)]
struct State {
    principals: Vec<PrincipalData>,
    /// Keyed by namespace
    collections: HashMap<String, MemoryCollection>,
}

#[derive(Default)]
struct MemoryCollection {
    indexes: Vec<IndexData>,
    documents: Vec<Document>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// A database that fails every operation with a connection error
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    /// Inserts a document, rejecting it if it duplicates the key of a unique index
    pub fn insert(
        &self,
        context: &DatabaseContext,
        collection: &str,
        document: Document,
    ) -> Result<()> {
        self.check_reachable()?;

        let namespace = context.namespace(collection);
        let mut state = self.state.lock();
        let collection = state.collections.entry(namespace.clone()).or_default();

        for index in collection.indexes.iter().filter(|i| i.unique) {
            let key = key_of(&document, &index.keys);

            if collection
                .documents
                .iter()
                .any(|d| key_of(d, &index.keys) == key)
            {
                return Err(DatabaseError::DuplicateKeyViolation {
                    collection: namespace,
                    name: index.name.clone(),
                    detail: format!("dup key: {}", describe_key(&index.keys, &key)),
                });
            }
        }

        collection.documents.push(document);
        Ok(())
    }

    /// Replaces the roles of a principal, like an administrator would out of band
    pub fn set_roles(&self, scope: &str, name: &str, roles: Vec<RoleGrant>) -> Result<()> {
        let mut state = self.state.lock();

        let principal = state
            .principals
            .iter_mut()
            .find(|p| p.scope == scope && p.name == name)
            .ok_or_else(|| DatabaseError::NotFound {
                resource: "principal",
                identifier: format!("{}@{}", name, scope),
            })?;

        principal.roles = roles;
        Ok(())
    }

    /// Removes an index, like an administrator would out of band
    pub fn drop_index(&self, context: &DatabaseContext, collection: &str, name: &str) {
        let mut state = self.state.lock();

        if let Some(collection) = state.collections.get_mut(&context.namespace(collection)) {
            collection.indexes.retain(|i| i.name != name);
        }
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(DatabaseError::Connection(
                "the in-memory server is unreachable".to_string(),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn create_principal(
        &self,
        scope: &str,
        principal: &Principal,
        _secret: &Secret,
    ) -> Result<()> {
        self.check_reachable()?;

        let mut state = self.state.lock();

        if state
            .principals
            .iter()
            .any(|p| p.scope == scope && p.name == principal.name)
        {
            return Err(DatabaseError::AlreadyExists {
                resource: "principal",
                identifier: format!("{}@{}", principal.name, scope),
            });
        }

        state.principals.push(PrincipalData {
            name: principal.name.clone(),
            scope: scope.to_string(),
            roles: principal.grants.clone(),
        });

        Ok(())
    }

    async fn principal(&self, scope: &str, name: &str) -> Result<PrincipalData> {
        self.check_reachable()?;

        self.state
            .lock()
            .principals
            .iter()
            .find(|p| p.scope == scope && p.name == name)
            .cloned()
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
        self.check_reachable()?;

        let namespace = context.namespace(&index.collection);
        let declared = IndexData::from(index);

        let mut state = self.state.lock();
        let collection = state.collections.entry(namespace.clone()).or_default();

        let existing = collection
            .indexes
            .iter()
            .find(|i| i.name == declared.name || i.keys == declared.keys);

        if let Some(existing) = existing {
            if *existing == declared {
                return Err(DatabaseError::AlreadyExists {
                    resource: "index",
                    identifier: format!("{} on {}", declared.name, namespace),
                });
            }

            return Err(DatabaseError::IndexConflict {
                collection: namespace,
                name: declared.name,
                detail: format!(
                    "existing index {} has keys {} and unique: {}",
                    existing.name, existing.keys, existing.unique
                ),
            });
        }

        if declared.unique {
            if let Some(key) = first_duplicate(&collection.documents, &declared.keys) {
                return Err(DatabaseError::DuplicateKeyViolation {
                    collection: namespace,
                    detail: format!("dup key: {}", describe_key(&declared.keys, &key)),
                    name: declared.name,
                });
            }
        }

        collection.indexes.push(declared);
        Ok(())
    }

    async fn list_indexes(
        &self,
        context: &DatabaseContext,
        collection: &str,
    ) -> Result<Vec<IndexData>> {
        self.check_reachable()?;

        let state = self.state.lock();
        let indexes = state
            .collections
            .get(&context.namespace(collection))
            .map(|c| c.indexes.clone())
            .unwrap_or_default();

        Ok(indexes)
    }
}

/// The values a document has for the indexed fields, where a missing field counts as null
fn key_of(document: &Document, keys: &KeySpec) -> Vec<Bson> {
    keys.fields()
        .map(|field| document.get(field).cloned().unwrap_or(Bson::Null))
        .collect()
}

fn first_duplicate(documents: &[Document], keys: &KeySpec) -> Option<Vec<Bson>> {
    let existing: Vec<_> = documents.iter().map(|d| key_of(d, keys)).collect();

    existing
        .iter()
        .enumerate()
        .find(|(i, key)| existing[..*i].contains(key))
        .map(|(_, key)| key.clone())
}

fn describe_key(keys: &KeySpec, values: &[Bson]) -> String {
    let mut document = Document::new();

    for (field, value) in keys.fields().zip(values) {
        document.insert(field, value.clone());
    }

    document.to_string()
}

#[cfg(test)]
mod test {
    use mongodb::bson::doc;

    use super::*;

    fn users_index() -> IndexDeclaration {
        IndexDeclaration::unique("users", KeySpec::new().ascending("user_id"))
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let db = MemoryDatabase::new();
        let context = db.select("bot");

        db.create_index(&context, &users_index()).await.unwrap();

        db.insert(&context, "users", doc! { "user_id": 1 }).unwrap();
        db.insert(&context, "users", doc! { "user_id": 2 }).unwrap();

        let result = db.insert(&context, "users", doc! { "user_id": 1, "name": "x" });
        assert!(
            matches!(result, Err(DatabaseError::DuplicateKeyViolation { .. })),
            "duplicate user_id should be rejected"
        );
    }

    #[tokio::test]
    async fn test_missing_fields_count_as_null() {
        let db = MemoryDatabase::new();
        let context = db.select("bot");

        db.create_index(&context, &users_index()).await.unwrap();
        db.insert(&context, "users", doc! { "name": "a" }).unwrap();

        let result = db.insert(&context, "users", doc! { "user_id": Bson::Null });
        assert!(matches!(
            result,
            Err(DatabaseError::DuplicateKeyViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_index_over_duplicates_is_not_created() {
        let db = MemoryDatabase::new();
        let context = db.select("bot");

        db.insert(&context, "users", doc! { "user_id": 7 }).unwrap();
        db.insert(&context, "users", doc! { "user_id": 7 }).unwrap();

        let result = db.create_index(&context, &users_index()).await;
        assert!(matches!(
            result,
            Err(DatabaseError::DuplicateKeyViolation { .. })
        ));

        let indexes = db.list_indexes(&context, "users").await.unwrap();
        assert!(indexes.is_empty(), "index should not have been created");
    }

    #[tokio::test]
    async fn test_conflicting_index() {
        let db = MemoryDatabase::new();
        let context = db.select("bot");

        let plain = IndexDeclaration::plain("users", KeySpec::new().ascending("user_id"));
        db.create_index(&context, &plain).await.unwrap();

        let result = db.create_index(&context, &users_index()).await;
        assert!(matches!(result, Err(DatabaseError::IndexConflict { .. })));

        let result = db.create_index(&context, &plain).await;
        assert!(result.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_databases_are_separate() {
        let db = MemoryDatabase::new();
        let bot = db.select("bot");
        let other = db.select("other");

        db.create_index(&bot, &users_index()).await.unwrap();

        assert_eq!(db.list_indexes(&bot, "users").await.unwrap().len(), 1);
        assert!(db.list_indexes(&other, "users").await.unwrap().is_empty());

        db.insert(&other, "users", doc! { "user_id": 1 }).unwrap();
        db.insert(&other, "users", doc! { "user_id": 1 }).unwrap();
    }

    #[tokio::test]
    async fn test_unreachable() {
        let db = MemoryDatabase::unreachable();

        assert!(matches!(
            db.ping().await,
            Err(DatabaseError::Connection(_))
        ));
    }
}
