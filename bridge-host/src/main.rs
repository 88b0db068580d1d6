// Bridge host daemon: config, server, model loop.

use std::sync::Arc;

use anyhow::Context;

mod config;
mod exec;
mod model;
mod relay;
mod router;
mod server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("bridge-host {}", VERSION);
            return Ok(());
        }
    }
    env_logger::init();

    let cfg = config::load();
    let (model_loop, bridge) = exec::ModelLoop::new(model::Model::new(cfg.material_width_m));
    let images =
        relay::HttpImageSource::new(&cfg.relay_url).context("failed to build relay client")?;
    let router = router::Router::new(bridge, Arc::new(images), cfg.port);

    let mut server = server::BridgeServer::new(router);
    server
        .start(cfg.port)
        .with_context(|| format!("failed to bind port {}", cfg.port))?;
    log::info!("bridge host {} listening on port {}", VERSION, cfg.port);

    // The main thread is the single-threaded execution context: it alone
    // runs model mutations until the process is terminated.
    model_loop.run();
    Ok(())
}
