use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use log::{info, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use videocall_signaling_server::router::create_router;

#[tokio::main]
async fn main() {
    TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .expect("failed to initialize logger");

    let address = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9001".to_string());
    let address = SocketAddr::from_str(&address).expect("invalid socket address provided");

    info!("signaling server listening on {}", address);
    axum::Server::bind(&address)
        .serve(create_router().into_make_service())
        .await
        .expect("server failed");
}
