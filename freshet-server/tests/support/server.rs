use std::net::SocketAddr;
use std::sync::Arc;

use freshet_server::{
    create_router, AppState, BroadcasterConfig, ChangeBroadcaster, InMemoryResourceStore,
    SequenceFloor, ServerConfig,
};
use tokio::task::JoinHandle;

pub struct TestServer {
    pub addr: SocketAddr,
    pub broadcaster: Arc<ChangeBroadcaster>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_server(broadcaster_config: BroadcasterConfig) -> TestServer {
    let config = ServerConfig {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        sequence_floor: SequenceFloor::Zero,
        ..ServerConfig::default()
    };
    let broadcaster = Arc::new(ChangeBroadcaster::new(broadcaster_config));
    let state = AppState::new(InMemoryResourceStore::new(), broadcaster.clone());
    let app = create_router(state, &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        addr,
        broadcaster,
        handle,
    }
}
