pub mod config;
pub mod server;

use std::sync::Arc;

use self::config::Config;

#[rustfmt::skip]
pub static SOFTWARE: &str = concat!("spalloc-proxy.", env!("CARGO_PKG_VERSION"));

/// In order to let integration tests use this crate directly without going
/// through `main`, the binary's whole startup sequence is exposed here.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    server::start(config).await
}
