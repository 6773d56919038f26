//! Declares the target bot's database schema and applies it to a MongoDB server.
mod bootstrap;
mod db;
mod schema;

pub use bootstrap::*;
pub use db::*;
pub use schema::*;
