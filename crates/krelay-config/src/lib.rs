//! YAML configuration schema, validation, default-template generation, and
//! the hot-reload watcher (spec §6; SPEC_FULL §6's ambient configuration
//! section).

pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;
pub mod watcher;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use validate::Config;
pub use watcher::ConfigWatcher;
