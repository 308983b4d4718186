//! hermes-sshappbackend/src/bin/hermes-agent.rs
//! The agent binary: runs on the remote host, dials back the reverse Unix
//! socket the controller opened (§4.E step 6/7), and answers its control
//! plane. Grounded on `remote-code/main.go`'s `main()`.

use hermes_sshappbackend::agent::runtime;
use hermes_sshappbackend::logging;
use hermes_sshappbackend::session;
use tokio::net::UnixStream;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    let log_level = std::env::var("HERMES_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    logging::init_logging(&log_level);

    let Ok(socket_path) = std::env::var("HERMES_API_SOCK") else {
        warn!("HERMES_API_SOCK is not defined! This will cause an issue unless the backend manually overwrites it");
        std::process::exit(1);
    };

    let stream = match UnixStream::connect(&socket_path).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, socket_path, "failed to connect to control socket");
            std::process::exit(1);
        }
    };

    let (runtime, transport) = runtime::prepare(stream);
    if let Err(e) = session::run_session(&runtime, transport).await {
        error!(error = %e, "agent session terminated");
        std::process::exit(1);
    }
}
