//! testenv-mock: canned HTTP responses for the `http_mock` server type
//!
//! Usage:
//!   testenv-mock --config routes.yaml --listen 127.0.0.1:8080

use testenv::{cli, mock, MockArgs};

#[tokio::main]
async fn main() {
    let args: MockArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(cli::log_filter(&args.log_level));
    env_logger::init_from_env(env);

    let routes = match mock::load_routes(std::path::Path::new(&args.config)) {
        Ok(routes) => routes,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {}", args.listen, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = mock::serve(listener, routes).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
