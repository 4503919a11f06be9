use bridge_hub::{
    config::load_config,
    logging::init_logging,
    pool::duration_ms,
    server::{self, AppState},
};
use std::net::SocketAddr;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    let log_file = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr, reason = "not loopback");
        return;
    }

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bridge_error", error = %err);
            return;
        }
    };

    info!(
        event = "bridge_start",
        addr = %config.addr,
        log_file = ?log_file,
        command_timeout_ms = duration_ms(config.command_timeout)
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let state = AppState::new(config);
    if let Err(err) = server::serve(listener, state, shutdown).await {
        error!(event = "bridge_error", error = %err);
    }
    info!(event = "bridge_stop");
}
