pub mod cache;
pub mod client;
pub mod source;
pub mod utils;

/// Default user agent - automatically uses the package version. Plugins
/// identify themselves with [`cache::config::PluginConfig::user_agent`].
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
