//! testenv CLI
//!
//! Usage:
//!   testenv --config testenv.yml pytest -x tests/
//!   testenv --config testenv.yml -l debug -- sh -c 'curl "$app_addr"'
//!   testenv --config testenv.yml --validate

use testenv::logging::{self, LogSink};
use testenv::{
    cli, install_signal_handlers, shutdown_channel, ConfigDocument, Runner, ServerEvent,
    TestenvArgs, ORCHESTRATION_FAILURE_EXIT,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    let args: TestenvArgs = argh::from_env();

    let sink = LogSink::stderr();
    logging::init(cli::log_filter(&args.log_level), &sink);

    log::info!("Loading config: {}", args.config);
    let document = match ConfigDocument::from_file(&args.config) {
        Ok(doc) => doc,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            std::process::exit(ORCHESTRATION_FAILURE_EXIT);
        }
    };

    if let Some(path) = document.config.log_path(&document.confdir) {
        if let Err(e) = sink.redirect_to_file(&path) {
            log::error!("Cannot log to {}: {}", path.display(), e);
            std::process::exit(ORCHESTRATION_FAILURE_EXIT);
        }
    }

    // Validate only mode
    if args.validate {
        let runner = Runner::new(document, Vec::new());
        match runner.plan() {
            Ok(order) => {
                println!("Config '{}' is valid", args.config);
                println!("  Servers: {}", order.len());
                println!("  Start order: {}", order.join(", "));
                return;
            }
            Err(e) => {
                log::error!("Invalid config: {}", e);
                std::process::exit(ORCHESTRATION_FAILURE_EXIT);
            }
        }
    }

    let (trigger, listener) = shutdown_channel();
    if let Err(e) = install_signal_handlers(trigger) {
        log::error!("Failed to install signal handlers: {}", e);
        std::process::exit(ORCHESTRATION_FAILURE_EXIT);
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let events = tokio::spawn(async move {
        while let Some((name, event)) = event_rx.recv().await {
            match event {
                ServerEvent::StopFailed(error) => log::warn!("[{}] Left running: {}", name, error),
                event => log::debug!("[{}] {:?}", name, event),
            }
        }
    });

    let mut runner = Runner::new(document, args.command).with_event_sender(event_tx);
    let code = match runner.run(listener).await {
        Ok(code) => code,
        // Already logged by the runner
        Err(e) => e.exit_code(),
    };

    drop(runner);
    let _ = events.await;
    log::debug!("testenv exiting with code {}", code);
    std::process::exit(code);
}
