use std::{fmt, time::Duration};

use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The database the bot stores its data in.
pub const DEFAULT_DATABASE: &str = "telegram_target_bot";
/// The database principals are created in.
pub const DEFAULT_AUTH_DATABASE: &str = "admin";
/// The name of the bootstrap principal.
pub const DEFAULT_PRINCIPAL: &str = "admin";

pub const READ_WRITE: &str = "readWrite";
pub const DB_ADMIN: &str = "dbAdmin";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeclarationError {
    #[error("Principal {0} must be granted at least one role")]
    NoGrants(String),
    #[error("Index on {0} must have at least one key")]
    NoKeys(String),
    #[error("The principal secret is empty")]
    EmptySecret,
}

/// Sort direction of a single indexed field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_i32(&self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }

    /// Reads a direction the way the server reports it, which may be any numeric type.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        let number = match value {
            Bson::Int32(x) => *x as f64,
            Bson::Int64(x) => *x as f64,
            Bson::Double(x) => *x,
            _ => return None,
        };

        if number > 0. {
            Some(Direction::Ascending)
        } else if number < 0. {
            Some(Direction::Descending)
        } else {
            None
        }
    }
}

/// An ordered mapping from field name to sort direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpec(Vec<(String, Direction)>);

impl KeySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ascending(mut self, field: &str) -> Self {
        self.0.push((field.to_string(), Direction::Ascending));
        self
    }

    pub fn descending(mut self, field: &str) -> Self {
        self.0.push((field.to_string(), Direction::Descending));
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(field, _)| field.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The name the server gives an index with these keys, e.g. `user_id_1_date_1`
    pub fn index_name(&self) -> String {
        self.0
            .iter()
            .map(|(field, direction)| format!("{}_{}", field, direction.as_i32()))
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn to_document(&self) -> Document {
        let mut document = Document::new();

        for (field, direction) in &self.0 {
            document.insert(field.clone(), direction.as_i32());
        }

        document
    }

    /// Returns `None` for keys that are not plain ascending/descending, like text or geo indexes.
    pub fn from_document(document: &Document) -> Option<Self> {
        document
            .iter()
            .map(|(field, value)| Direction::from_bson(value).map(|d| (field.clone(), d)))
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_document(), f)
    }
}

/// A declared index on a collection in the target database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDeclaration {
    pub collection: String,
    pub keys: KeySpec,
    pub unique: bool,
    /// Documents expire this long after the time stored in the indexed field
    pub expire_after: Option<Duration>,
}

impl IndexDeclaration {
    pub fn unique(collection: &str, keys: KeySpec) -> Self {
        Self {
            collection: collection.to_string(),
            keys,
            unique: true,
            expire_after: None,
        }
    }

    pub fn plain(collection: &str, keys: KeySpec) -> Self {
        Self {
            unique: false,
            ..Self::unique(collection, keys)
        }
    }

    pub fn ttl(collection: &str, keys: KeySpec, expire_after: Duration) -> Self {
        Self {
            expire_after: Some(expire_after),
            ..Self::plain(collection, keys)
        }
    }

    pub fn name(&self) -> String {
        self.keys.index_name()
    }

    /// Whether an existing index has exactly this specification.
    ///
    /// Sparse and partial indexes skip some documents, so they never satisfy a declaration.
    pub fn is_satisfied_by(&self, index: &IndexData) -> bool {
        index.keys == self.keys
            && index.unique == self.unique
            && index.expire_after == self.expire_after
            && !index.sparse
            && index.partial_filter.is_none()
    }
}

/// An index as it exists on the server
#[derive(Debug, Clone, PartialEq)]
pub struct IndexData {
    pub name: String,
    pub keys: KeySpec,
    pub unique: bool,
    pub expire_after: Option<Duration>,
    /// Documents without the indexed fields are left out
    pub sparse: bool,
    /// Only documents matching this filter are indexed
    pub partial_filter: Option<Document>,
}

impl From<&IndexDeclaration> for IndexData {
    fn from(value: &IndexDeclaration) -> Self {
        Self {
            name: value.name(),
            keys: value.keys.clone(),
            unique: value.unique,
            expire_after: value.expire_after,
            sparse: false,
            partial_filter: None,
        }
    }
}

/// A named role restricted to one database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleGrant {
    pub role: String,
    #[serde(rename = "db")]
    pub database: String,
}

impl RoleGrant {
    pub fn new(role: &str, database: &str) -> Self {
        Self {
            role: role.to_string(),
            database: database.to_string(),
        }
    }
}

impl fmt::Display for RoleGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.role, self.database)
    }
}

/// The principal to create, without its secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub grants: Vec<RoleGrant>,
}

impl Principal {
    pub fn new(name: &str, grants: Vec<RoleGrant>) -> Result<Self, DeclarationError> {
        if grants.is_empty() {
            return Err(DeclarationError::NoGrants(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            grants,
        })
    }

    /// Whether the grants are the declared ones, ignoring order
    pub fn has_exact_grants(&self, grants: &[RoleGrant]) -> bool {
        let mut expected = self.grants.clone();
        let mut found = grants.to_vec();

        expected.sort();
        expected.dedup();
        found.sort();
        found.dedup();

        expected == found
    }
}

/// A principal as it exists on the server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrincipalData {
    #[serde(rename = "user")]
    pub name: String,
    #[serde(rename = "db")]
    pub scope: String,
    pub roles: Vec<RoleGrant>,
}

/// The password of a principal. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: String) -> Result<Self, DeclarationError> {
        if secret.is_empty() {
            return Err(DeclarationError::EmptySecret);
        }

        Ok(Self(secret))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Everything the bootstrap sequence puts in place
#[derive(Debug, Clone)]
pub struct Schema {
    /// Where the principal is created
    pub auth_database: String,
    /// The database the indexes are declared on
    pub database: String,
    pub principal: Principal,
    pub indexes: Vec<IndexDeclaration>,
}

impl Schema {
    /// The bot schema: a principal with `readWrite` and `dbAdmin` on `database`, and the three unique indexes.
    pub fn target_bot(
        principal: &str,
        auth_database: &str,
        database: &str,
    ) -> Result<Self, DeclarationError> {
        let principal = Principal::new(
            principal,
            vec![
                RoleGrant::new(READ_WRITE, database),
                RoleGrant::new(DB_ADMIN, database),
            ],
        )?;

        Ok(Self {
            auth_database: auth_database.to_string(),
            database: database.to_string(),
            principal,
            indexes: core_indexes(),
        })
    }

    /// Appends the secondary indexes the bot itself relies on.
    pub fn with_app_indexes(mut self) -> Self {
        self.indexes.extend(app_indexes());
        self
    }

    pub fn validate(&self) -> Result<(), DeclarationError> {
        if self.principal.grants.is_empty() {
            return Err(DeclarationError::NoGrants(self.principal.name.clone()));
        }

        match self.indexes.iter().find(|i| i.keys.is_empty()) {
            Some(index) => Err(DeclarationError::NoKeys(index.collection.clone())),
            None => Ok(()),
        }
    }
}

pub fn core_indexes() -> Vec<IndexDeclaration> {
    vec![
        IndexDeclaration::unique("targets", KeySpec::new().ascending("user_id").ascending("date")),
        IndexDeclaration::unique("users", KeySpec::new().ascending("user_id")),
        IndexDeclaration::unique("group_settings", KeySpec::new().ascending("group_id")),
    ]
}

pub fn app_indexes() -> Vec<IndexDeclaration> {
    vec![
        IndexDeclaration::plain("targets", KeySpec::new().ascending("group_id").ascending("date")),
        IndexDeclaration::unique(
            "registrations",
            KeySpec::new().ascending("user_id").ascending("group_id"),
        ),
        IndexDeclaration::plain("registrations", KeySpec::new().ascending("verification_code")),
        IndexDeclaration::unique(
            "muted_users",
            KeySpec::new().ascending("user_id").ascending("group_id"),
        ),
        // Expires at the time stored in the field itself
        IndexDeclaration::ttl(
            "muted_users",
            KeySpec::new().ascending("muted_until"),
            Duration::ZERO,
        ),
    ]
}

#[cfg(test)]
mod test {
    use mongodb::bson::doc;

    use super::*;

    #[test]
    fn test_index_names() {
        let names: Vec<_> = core_indexes().iter().map(|i| i.name()).collect();

        assert_eq!(names, vec!["user_id_1_date_1", "user_id_1", "group_id_1"]);
        assert_eq!(
            KeySpec::new().ascending("a").descending("b").index_name(),
            "a_1_b_-1"
        );
    }

    #[test]
    fn test_key_order_is_kept() {
        let keys = KeySpec::new().ascending("user_id").ascending("date");
        let document = keys.to_document();

        let fields: Vec<_> = document.keys().map(|k| k.as_str()).collect();
        assert_eq!(fields, vec!["user_id", "date"]);

        assert_ne!(
            keys,
            KeySpec::new().ascending("date").ascending("user_id"),
            "field order should matter"
        );
    }

    #[test]
    fn test_key_spec_from_server_document() {
        let keys = KeySpec::from_document(&doc! { "user_id": 1.0, "date": -1_i64 });

        assert_eq!(
            keys,
            Some(KeySpec::new().ascending("user_id").descending("date"))
        );
        assert_eq!(KeySpec::from_document(&doc! { "bio": "text" }), None);
    }

    #[test]
    fn test_target_bot_schema() {
        let schema = Schema::target_bot("admin", "admin", "telegram_target_bot").unwrap();

        assert_eq!(
            schema.principal.grants,
            vec![
                RoleGrant::new("readWrite", "telegram_target_bot"),
                RoleGrant::new("dbAdmin", "telegram_target_bot"),
            ]
        );
        assert_eq!(schema.indexes.len(), 3);
        assert!(schema.indexes.iter().all(|i| i.unique));
        assert_eq!(schema.validate(), Ok(()));

        let extended = schema.with_app_indexes();
        assert_eq!(extended.indexes.len(), 8);
        assert_eq!(extended.validate(), Ok(()));
    }

    #[test]
    fn test_weaker_indexes_do_not_satisfy() {
        let declared = IndexDeclaration::unique("users", KeySpec::new().ascending("user_id"));
        let existing = IndexData::from(&declared);

        assert!(declared.is_satisfied_by(&existing));

        let sparse = IndexData {
            sparse: true,
            ..existing.clone()
        };
        assert!(!declared.is_satisfied_by(&sparse));

        let partial = IndexData {
            partial_filter: Some(doc! { "user_id": { "$gt": 0 } }),
            ..existing.clone()
        };
        assert!(!declared.is_satisfied_by(&partial));

        let not_unique = IndexData {
            unique: false,
            ..existing
        };
        assert!(!declared.is_satisfied_by(&not_unique));
    }

    #[test]
    fn test_exact_grants() {
        let principal = Principal::new(
            "admin",
            vec![RoleGrant::new(READ_WRITE, "bot"), RoleGrant::new(DB_ADMIN, "bot")],
        )
        .unwrap();

        assert!(principal.has_exact_grants(&[
            RoleGrant::new(DB_ADMIN, "bot"),
            RoleGrant::new(READ_WRITE, "bot"),
        ]));
        assert!(!principal.has_exact_grants(&[RoleGrant::new(READ_WRITE, "bot")]));
        assert!(!principal.has_exact_grants(&[
            RoleGrant::new(READ_WRITE, "bot"),
            RoleGrant::new(DB_ADMIN, "bot"),
            RoleGrant::new("root", "admin"),
        ]));
    }

    #[test]
    fn test_rejects_empty_declarations() {
        assert_eq!(
            Principal::new("admin", vec![]),
            Err(DeclarationError::NoGrants("admin".to_string()))
        );
        assert_eq!(
            Secret::new(String::new()),
            Err(DeclarationError::EmptySecret)
        );
    }

    #[test]
    fn test_secret_is_not_printed() {
        let secret = Secret::new("hunter2".to_string()).unwrap();

        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }
}
