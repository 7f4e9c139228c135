//! Diff algebra for declared vs observed resource records.
//!
//! Nothing in here performs I/O: the reconciliation engine feeds keyed records in and gets
//! deterministic create/update/delete sets back.

pub mod diff;
pub mod record;

pub use diff::{Diff, diff};
pub use record::{Record, differing_fields, equivalent, normalize, values_equal};
