use pawpaint_view::{
    api::{build_router, AppState},
    config::Config,
};
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;

/// Serve the router on an ephemeral port with the given configuration.
pub async fn spawn_server(mut config: Config) -> (SocketAddr, JoinHandle<()>, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    config.bind = addr.to_string();

    let state = AppState::new(config).unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state)
}

pub fn png(tag: &str) -> String {
    format!("data:image/png;base64,{tag}")
}
