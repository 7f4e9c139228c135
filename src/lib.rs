pub mod cloud;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod modules;
pub mod orchestrator;
pub mod registry;
pub mod utils;

pub use cloud::{HttpCloud, MemoryCloud, ResourceApi};
pub use config::Config;
pub use db::Account;
pub use engine::{Direction, RunSummary};
pub use error::{CloudApiError, CloudrowError};
pub use orchestrator::{OperationKind, OperationOutcome, OperationRecord, OperationStatus, Orchestrator};
pub use registry::{Catalog, ModuleDef};
