//! Database module: one SQLite database per target, owned by a store actor.
//!
//! Layout:
//! - `schema.rs`: platform DDL (modules, operations, account)
//! - `models.rs`: Rust structs mirroring DB rows
//! - `codec.rs`: `TableSpec`-driven encoding of entity records
//! - `actor.rs`: the actor serializing all access to the pool

pub mod actor;
pub mod models;
pub mod schema;

mod codec;

pub use actor::{StoreHandle, spawn};
pub use models::{
    Account, AccountRegion, DbModule, DbOperation, InstalledModule, ModuleInstall,
    ModuleUninstall, NewOperation, StoredRecord,
};
pub use schema::PLATFORM_INIT;
