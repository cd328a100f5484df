//! Server-Sent Events broadcasting server.
//!
//! Clients subscribe to named channels with `GET /<channel>` and receive an
//! SSE stream; publishers push JSON events with `POST /<channel>` or through
//! an external input feed, and every event fans out to the channel's
//! subscribers.

pub mod channel;
pub mod client;
pub mod config;
pub mod event;
pub mod http;
pub mod input;
pub mod response;
pub mod server;
pub mod stats;

pub use config::Config;
pub use event::Event;
pub use server::{Server, ServerError};

use tracing::info;

pub async fn signal_handler() {
    tokio::signal::ctrl_c().await.unwrap();
}

/// Bring the server up and run it until interrupted.
pub async fn run(config: Config) -> Result<(), ServerError> {
    use futures::future::{FutureExt, select_all};
    use futures::pin_mut;
    use std::future::Future;
    use std::pin::Pin;

    let input_enabled = config.input.enabled;
    let input_address = config.input.address.clone();
    let server = Server::new(config);
    let listener = server.bind().await?;
    info!(addr = %listener.local_addr()?, "listening");

    if input_enabled {
        use input::InputSource;
        Box::new(input::TcpInputSource::new(input_address)).start(server.clone());
    }

    let fut_accept = server.accept_loop(listener).fuse();
    let fut_sig = signal_handler().fuse();

    pin_mut!(fut_accept, fut_sig);
    let futures: Vec<Pin<&mut dyn Future<Output = ()>>> = vec![fut_accept, fut_sig];
    select_all(futures).await;
    info!("shutting down");
    Ok(())
}
