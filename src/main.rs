#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use spalloc_proxy::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.job.boards.is_empty() {
        log::warn!(
            "no boards configured for the demo job, sessions will be able to open no channels"
        );
    }

    spalloc_proxy::startup(config).await
}
