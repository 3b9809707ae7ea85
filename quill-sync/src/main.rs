use log::error;

use quill_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server stopped: {e}");
        std::process::exit(1);
    }
}
