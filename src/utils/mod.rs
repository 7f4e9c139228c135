pub mod logging;

pub use logging::init_tracing;
pub(crate) use logging::with_pretty_json_debug;
