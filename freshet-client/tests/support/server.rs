use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use freshet_server::{
    create_router, AppState, BroadcasterConfig, ChangeBroadcaster, InMemoryResourceStore,
    SequenceFloor, ServerConfig,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// An in-process server whose backing store and broadcaster outlive it, so
/// a test can stop and restart it on the same address.
pub struct TestServer {
    pub addr: SocketAddr,
    pub broadcaster: Arc<ChangeBroadcaster>,
    pub backing: Arc<InMemoryResourceStore>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/ws", self.addr)
    }

    /// Close every socket and stop accepting connections.
    pub async fn stop(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
        self.broadcaster.disconnect_all();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.broadcaster.disconnect_all();
    }
}

pub async fn spawn_server(backing: Arc<InMemoryResourceStore>) -> TestServer {
    let broadcaster = Arc::new(ChangeBroadcaster::new(BroadcasterConfig::default()));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    serve(listener, backing, broadcaster)
}

/// Start serving on `addr` again, retrying while the old listener is
/// released.
pub async fn restart_server(
    addr: SocketAddr,
    backing: Arc<InMemoryResourceStore>,
    broadcaster: Arc<ChangeBroadcaster>,
) -> TestServer {
    let mut attempts = 0;
    let listener = loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => break listener,
            Err(_) if attempts < 50 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("rebinding {addr} failed: {e}"),
        }
    };
    serve(listener, backing, broadcaster)
}

fn serve(
    listener: TcpListener,
    backing: Arc<InMemoryResourceStore>,
    broadcaster: Arc<ChangeBroadcaster>,
) -> TestServer {
    let config = ServerConfig {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        sequence_floor: SequenceFloor::Zero,
        ..ServerConfig::default()
    };
    let state = AppState::new(backing.clone(), broadcaster.clone());
    let app = create_router(state, &config);
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        addr,
        broadcaster,
        backing,
        handle,
    }
}
