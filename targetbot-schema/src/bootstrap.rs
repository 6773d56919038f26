use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{Database, DatabaseError, DatabaseResult, IndexDeclaration, Schema, Secret};

/// A step of the bootstrap sequence, named by what it acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Ping,
    Principal { name: String, scope: String },
    Select { database: String },
    Index { namespace: String, name: String },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Ping => write!(f, "ping"),
            Step::Principal { name, scope } => write!(f, "principal {}@{}", name, scope),
            Step::Select { database } => write!(f, "database {}", database),
            Step::Index { namespace, name } => write!(f, "index {} on {}", name, namespace),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The step changed the database
    Applied,
    /// The step found its result already in place
    AlreadyPresent,
    /// The step only bound later steps to a database, which never changes it
    Selected,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Applied => f.write_str("applied"),
            Outcome::AlreadyPresent => f.write_str("already present"),
            Outcome::Selected => f.write_str("selected"),
        }
    }
}

#[derive(Debug, Error)]
#[error("Step {step} failed: {source}")]
pub struct BootstrapError {
    pub step: Step,
    #[source]
    pub source: DatabaseError,
}

/// What each step of a completed sequence did, in order
#[derive(Debug, Default)]
pub struct Report {
    pub entries: Vec<(Step, Outcome)>,
}

impl Report {
    fn push(&mut self, step: Step, outcome: Outcome) {
        info!("{}: {}", step, outcome);
        self.entries.push((step, outcome));
    }

    /// How many steps changed the database
    pub fn applied_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, o)| *o == Outcome::Applied)
            .count()
    }

    pub fn outcome(&self, step: &Step) -> Option<Outcome> {
        self.entries
            .iter()
            .find_map(|(s, o)| (s == step).then_some(*o))
    }
}

/// Runs the bootstrap sequence against a database.
///
/// Steps run in a fixed order: principal, database selection, then every index in declaration order.
/// The first failing step aborts the rest.
pub struct Bootstrap<'a> {
    database: &'a dyn Database,
    schema: &'a Schema,
}

impl<'a> Bootstrap<'a> {
    pub fn new(database: &'a dyn Database, schema: &'a Schema) -> Self {
        Self { database, schema }
    }

    /// Puts the schema in place. Steps already applied are reported as such, so a rerun succeeds.
    pub async fn apply(&self, secret: &Secret) -> Result<Report, BootstrapError> {
        let mut report = Report::default();

        self.ping().await?;

        let principal = &self.schema.principal;
        let scope = &self.schema.auth_database;
        let step = self.principal_step();

        debug!("Creating {} with roles {:?}", step, principal.grants);

        let created = self
            .database
            .create_principal(scope, principal, secret)
            .await
            .existing_ok()
            .map_err(|e| fail(&step, e))?;

        if created.is_none() {
            let existing = self
                .database
                .principal(scope, &principal.name)
                .await
                .map_err(|e| fail(&step, e))?;

            if !principal.has_exact_grants(&existing.roles) {
                warn!(
                    "{} already exists with different roles, leaving them as they are: {}",
                    step,
                    describe_roles(&existing.roles)
                );
            }
        }

        report.push(step, outcome_of(created));

        let context = self.database.select(&self.schema.database);
        report.push(
            Step::Select {
                database: context.name().to_string(),
            },
            Outcome::Selected,
        );

        for index in &self.schema.indexes {
            let step = index_step(&context.namespace(&index.collection), index);

            debug!("Creating {} with keys {}", step, index.keys);

            let created = self
                .database
                .create_index(&context, index)
                .await
                .existing_ok()
                .map_err(|e| fail(&step, e))?;

            report.push(step, outcome_of(created));
        }

        Ok(report)
    }

    /// Checks that the schema is in place exactly as declared, without changing anything.
    pub async fn verify(&self) -> Result<Report, BootstrapError> {
        let mut report = Report::default();

        self.ping().await?;

        let principal = &self.schema.principal;
        let step = self.principal_step();

        let existing = self
            .database
            .principal(&self.schema.auth_database, &principal.name)
            .await
            .map_err(|e| fail(&step, e))?;

        if !principal.has_exact_grants(&existing.roles) {
            let error = DatabaseError::Mismatch {
                resource: "principal",
                identifier: format!("{}@{}", existing.name, existing.scope),
                detail: format!(
                    "expected roles {}, found {}",
                    describe_roles(&principal.grants),
                    describe_roles(&existing.roles)
                ),
            };

            return Err(fail(&step, error));
        }

        report.push(step, Outcome::AlreadyPresent);

        let context = self.database.select(&self.schema.database);
        report.push(
            Step::Select {
                database: context.name().to_string(),
            },
            Outcome::Selected,
        );

        for index in &self.schema.indexes {
            let namespace = context.namespace(&index.collection);
            let step = index_step(&namespace, index);
            let name = index.name();

            let indexes = self
                .database
                .list_indexes(&context, &index.collection)
                .await
                .map_err(|e| fail(&step, e))?;

            let error = match indexes.iter().find(|i| i.name == name) {
                None => DatabaseError::NotFound {
                    resource: "index",
                    identifier: format!("{} on {}", name, namespace),
                },
                Some(existing) if !index.is_satisfied_by(existing) => DatabaseError::Mismatch {
                    resource: "index",
                    identifier: format!("{} on {}", name, namespace),
                    detail: format!(
                        "expected keys {} and unique: {}, found keys {}, unique: {}, sparse: {}, partial filter: {:?}",
                        index.keys,
                        index.unique,
                        existing.keys,
                        existing.unique,
                        existing.sparse,
                        existing.partial_filter
                    ),
                },
                Some(_) => {
                    report.push(step, Outcome::AlreadyPresent);
                    continue;
                }
            };

            return Err(fail(&step, error));
        }

        Ok(report)
    }

    async fn ping(&self) -> Result<(), BootstrapError> {
        self.database
            .ping()
            .await
            .map_err(|e| fail(&Step::Ping, e))
    }

    fn principal_step(&self) -> Step {
        Step::Principal {
            name: self.schema.principal.name.clone(),
            scope: self.schema.auth_database.clone(),
        }
    }
}

fn fail(step: &Step, source: DatabaseError) -> BootstrapError {
    BootstrapError {
        step: step.clone(),
        source,
    }
}

fn index_step(namespace: &str, index: &IndexDeclaration) -> Step {
    Step::Index {
        namespace: namespace.to_string(),
        name: index.name(),
    }
}

fn outcome_of<T>(created: Option<T>) -> Outcome {
    match created {
        Some(_) => Outcome::Applied,
        None => Outcome::AlreadyPresent,
    }
}

fn describe_roles(roles: &[crate::RoleGrant]) -> String {
    let roles: Vec<_> = roles.iter().map(|r| r.to_string()).collect();
    format!("[{}]", roles.join(", "))
}
