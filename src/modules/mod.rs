//! Resource modules shipped with this build.

pub mod firewall;
pub mod network;

use crate::error::CloudrowError;
use crate::registry::Catalog;

pub fn catalog() -> Result<Catalog, CloudrowError> {
    Catalog::new([network::module(), firewall::module()])
}
