pub mod error;
pub mod logger;

pub use error::{ErrorKind, PluginError, PluginResult};
