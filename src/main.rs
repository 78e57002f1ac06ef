use std::path::Path;
use std::sync::Arc;

use room_coordinator::upload::HttpSaveService;
use room_coordinator::{routes, Config, Hub};

fn tls_files_present(cert_path: &Path, key_path: &Path) -> bool {
    for path in [cert_path, key_path] {
        if let Err(e) = std::fs::File::open(path) {
            log::error!("Failed to open TLS file {}: {}", path.display(), e);
            return false;
        }
    }
    true
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let service = match HttpSaveService::new(&config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            log::error!("Failed to build storage client: {e}");
            std::process::exit(1);
        }
    };

    let hub = match Hub::new(&config, service).await {
        Ok(hub) => hub,
        Err(e) => {
            log::error!(
                "Failed to create scratch directory {}: {e}",
                config.scratch_dir.display()
            );
            std::process::exit(1);
        }
    };
    hub.spawn_scheduler();

    let routes = routes(hub, config.static_dir.clone());

    match config.tls_paths() {
        Some((cert, key)) if tls_files_present(cert, key) => {
            log::info!("Server running on https://{}", config.bind_addr);
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(config.bind_addr)
                .await;
        }
        tls => {
            if tls.is_some() {
                log::warn!("Failed to load TLS files, falling back to HTTP/WS");
            }
            log::info!("Server running on http://{}", config.bind_addr);
            warp::serve(routes).run(config.bind_addr).await;
        }
    }
}
