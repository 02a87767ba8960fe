use nocturne::{init_logging, Config, WebServer};

fn main() {
    init_logging();

    let config = Config::from_env();
    match WebServer::new(&config) {
        Ok(mut server) => server.run(),
        Err(e) => {
            tracing::error!("server init error: {}", e);
            std::process::exit(1);
        }
    }
}
