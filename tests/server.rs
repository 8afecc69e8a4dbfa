//! Serves over a real socket and talks to it with the bundled HTTP client.

use std::time::Duration;

use flow::{Application, Config, Context, HttpClient, HttpClientConfig, Router, RouterGroup, Server, Service};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

async fn echo(ctx: Context) {
    ctx.json(&json!({
        "method": ctx.method(),
        "q": ctx.string_param("q"),
        "n": ctx.int_param("n"),
        "header": ctx.header("x-app").unwrap_or_default(),
        "ip": ctx.client_ip(),
    }));
}

#[derive(Serialize)]
struct Query<'a> {
    q: &'a str,
}

#[tokio::test]
async fn serves_until_shutdown() {
    let app = Application::new(Config::default()).unwrap();
    let router = Router::new().mount(RouterGroup::new().get("/echo", echo).post("/echo", echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::from_listener(listener);
    let base = format!("http://{}", server.local_addr().unwrap());

    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_with_shutdown(Service::new(app, router), async {
        let _ = stopped.await;
    }));

    let client_config = HttpClientConfig {
        headers: [("x-app".to_owned(), "tests".to_owned())].into(),
        ..HttpClientConfig::default()
    };
    let client = HttpClient::new(&client_config).unwrap();

    let got = client
        .get(&format!("{base}/echo"), Some(&Query { q: "hello" }), &[])
        .await
        .unwrap();
    assert_eq!(got.status, 200);
    let body: Value = got.parse().unwrap();
    assert_eq!(body["method"], "GET");
    assert_eq!(body["q"], "hello");
    assert_eq!(body["header"], "tests");
    assert_eq!(body["ip"], "127.0.0.1");

    let posted = client
        .post(&format!("{base}/echo"), Some(&json!({ "n": 7 })), &[("x-app", "override")])
        .await
        .unwrap();
    let body: Value = posted.parse().unwrap();
    assert_eq!(body["method"], "POST");
    assert_eq!(body["n"], 7);

    let missing = client.get::<()>(&format!("{base}/nowhere"), None, &[]).await.unwrap();
    assert_eq!(missing.status, 404);
    assert_eq!(missing.text(), "404 page not found");

    // The client's pooled keep-alive connections are still open here.
    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();
    drop(client);
}

#[tokio::test]
async fn idle_keep_alive_connection_does_not_block_shutdown() {
    let app = Application::new(Config::default()).unwrap();
    let router = Router::new().mount(RouterGroup::new().get("/echo", echo));
    let server = Server::from_listener(TcpListener::bind("127.0.0.1:0").await.unwrap());
    let addr = server.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_with_shutdown(Service::new(app, router), async {
        let _ = stopped.await;
    }));

    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(b"GET /echo HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = socket.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    // The socket stays open and idle while the server shuts down.
    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();

    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut rest)).await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn drain_timeout_bounds_a_stuck_request() {
    async fn stuck(_ctx: Context) {
        std::future::pending::<()>().await;
    }

    let app = Application::new(Config::default()).unwrap();
    let router = Router::new().mount(RouterGroup::new().get("/stuck", stuck));
    let server = Server::from_listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
        .drain_timeout(Duration::from_millis(200));
    let addr = server.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve_with_shutdown(Service::new(app, router), async {
        let _ = stopped.await;
    }));

    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(b"GET /stuck HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    // Let the request reach the handler.
    tokio::time::sleep(Duration::from_millis(100)).await;

    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), serving).await.unwrap().unwrap().unwrap();
}
