//! End-to-end tests: real clients against the public port.


use std::net::SocketAddr;
use std::sync::Arc;

use harness::{
    read_all, socks_connect, split_response, test_config, tls_client_connect, FrontDoorHandle,
    OriginServer, TcpEchoBackend, TlsMaterial, ADMIN_PASSWORD, ADMIN_USER, TEST_TIMEOUT,
};
use onedoor::backend::admin::Credentials;
use onedoor::proxy_protocol::ProxyHeader;
use onedoor::{FrontDoor, StartupError, Whitelist};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn auth_header() -> String {
    Credentials::new(ADMIN_USER, ADMIN_PASSWORD).header_value()
}

async fn admin_request(front_door: &FrontDoorHandle, request: String) -> (String, String) {
    let mut tls = tls_client_connect(front_door.public_addr, "localhost", &front_door.tls.cert_der)
        .await
        .expect("TLS handshake through the public port");
    tls.write_all(request.as_bytes()).await.unwrap();
    split_response(&read_all(&mut tls).await)
}

#[tokio::test]
async fn socks_client_is_relayed_to_target() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let front_door = FrontDoorHandle::spawn(&[]).await.unwrap();

    let mut client = TcpStream::connect(front_door.public_addr).await.unwrap();
    let reply = socks_connect(&mut client, echo.addr).await.unwrap();
    assert_eq!(reply, 0x00);

    client.write_all(b"hello through the door").await.unwrap();
    let mut buf = [0u8; 22];
    tokio::time::timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the door");
    assert_eq!(echo.connection_count(), 1);
}

#[tokio::test]
async fn http_proxy_request_is_forwarded_to_origin() {
    let mut origin = OriginServer::spawn("origin says hi").await.unwrap();
    let front_door = FrontDoorHandle::spawn(&[]).await.unwrap();

    let mut client = TcpStream::connect(front_door.public_addr).await.unwrap();
    let request = format!(
        "GET http://{addr}/status?x=1 HTTP/1.1\r\nHost: {addr}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
        addr = origin.addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let (status, body) = split_response(&read_all(&mut client).await);
    assert!(status.contains("200"), "status: {status}");
    assert_eq!(body, "origin says hi");

    let head = origin.next_head().await.expect("origin saw the request");
    assert!(head.starts_with("GET /status?x=1 HTTP/1.1\r\n"), "head: {head}");
    assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
}

#[tokio::test]
async fn admin_requires_basic_auth() {
    let front_door = FrontDoorHandle::spawn(&[]).await.unwrap();

    let (status, _) = admin_request(
        &front_door,
        "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;
    assert!(status.contains("401"), "status: {status}");
}

#[tokio::test]
async fn admin_lists_and_edits_whitelist() {
    let front_door = FrontDoorHandle::spawn(&["10.0.0.1"]).await.unwrap();

    let (status, body) = admin_request(
        &front_door,
        format!(
            "GET / HTTP/1.1\r\nHost: localhost\r\nAuthorization: {}\r\nConnection: close\r\n\r\n",
            auth_header()
        ),
    )
    .await;
    assert!(status.contains("200"), "status: {status}");
    let index: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(index["whitelist"], serde_json::json!(["10.0.0.1"]));
    assert_eq!(index["remoteaddr"], "127.0.0.1");

    let form = "add=127.0.0.1";
    let (status, body) = admin_request(
        &front_door,
        format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nAuthorization: {}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{form}",
            auth_header(),
            form.len()
        ),
    )
    .await;
    assert!(status.contains("200"), "status: {status}");
    let success: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(success["success"], true);
    assert!(front_door.whitelist.contains("127.0.0.1"));

    let (_, body) = admin_request(
        &front_door,
        format!(
            "POST /?remove=10.0.0.1 HTTP/1.1\r\nHost: localhost\r\nAuthorization: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            auth_header()
        ),
    )
    .await;
    let success: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(success["success"], true);
    assert_eq!(front_door.whitelist.all(), vec!["127.0.0.1".to_string()]);
}

#[tokio::test]
async fn unlisted_client_is_refused_before_any_relay() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let front_door = FrontDoorHandle::spawn(&["10.0.0.1"]).await.unwrap();

    let mut client = TcpStream::connect(front_door.public_addr).await.unwrap();
    let result = tokio::time::timeout(TEST_TIMEOUT, socks_connect(&mut client, echo.addr))
        .await
        .unwrap();
    assert!(result.is_err(), "unlisted client was served: {result:?}");
    assert_eq!(echo.connection_count(), 0);
}

#[tokio::test]
async fn whitelist_edits_apply_to_the_next_connection() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let front_door = FrontDoorHandle::spawn(&["10.0.0.1"]).await.unwrap();

    front_door.whitelist.add("127.0.0.1");

    let mut client = TcpStream::connect(front_door.public_addr).await.unwrap();
    let reply = socks_connect(&mut client, echo.addr).await.unwrap();
    assert_eq!(reply, 0x00);
}

#[tokio::test]
async fn backend_trusts_the_mux_supplied_client_address() {
    let echo = TcpEchoBackend::spawn().await.unwrap();
    let front_door = FrontDoorHandle::spawn(&["10.0.0.1"]).await.unwrap();

    let header_from = |ip: &str| {
        let source: SocketAddr = format!("{ip}:40000").parse().unwrap();
        ProxyHeader::new(source, front_door.public_addr).encode()
    };

    // Denied client: closed before the greeting is answered.
    let mut denied = TcpStream::connect(front_door.socks_addr).await.unwrap();
    denied.write_all(&header_from("10.0.0.2")).await.unwrap();
    let result = tokio::time::timeout(TEST_TIMEOUT, socks_connect(&mut denied, echo.addr))
        .await
        .unwrap();
    assert!(result.is_err());
    assert_eq!(echo.connection_count(), 0);

    let mut allowed = TcpStream::connect(front_door.socks_addr).await.unwrap();
    allowed.write_all(&header_from("10.0.0.1")).await.unwrap();
    let reply = socks_connect(&mut allowed, echo.addr).await.unwrap();
    assert_eq!(reply, 0x00);

    allowed.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(TEST_TIMEOUT, allowed.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(echo.connection_count(), 1);
}

#[tokio::test]
async fn unclassifiable_traffic_is_closed() {
    let front_door = FrontDoorHandle::spawn(&[]).await.unwrap();

    let mut client = TcpStream::connect(front_door.public_addr).await.unwrap();
    client
        .write_all(b"SSH-2.0-OpenSSH_9.6 not a proxy protocol\r\n")
        .await
        .unwrap();

    let received = read_all(&mut client).await;
    assert!(received.is_empty());
}

#[tokio::test]
async fn target_close_propagates_to_client() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = target.accept().await {
            let _ = stream.write_all(b"bye").await;
        }
    });

    let front_door = FrontDoorHandle::spawn(&[]).await.unwrap();
    let mut client = TcpStream::connect(front_door.public_addr).await.unwrap();
    let reply = socks_connect(&mut client, target_addr).await.unwrap();
    assert_eq!(reply, 0x00);

    let mut received = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
        .await
        .expect("client saw EOF once the target closed")
        .unwrap();
    assert_eq!(received, b"bye");
}

#[tokio::test]
async fn client_close_propagates_to_target() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = target.accept().await {
            let mut received = Vec::new();
            let _ = stream.read_to_end(&mut received).await;
            let _ = seen_tx.send(received);
        }
    });

    let front_door = FrontDoorHandle::spawn(&[]).await.unwrap();
    let mut client = TcpStream::connect(front_door.public_addr).await.unwrap();
    let reply = socks_connect(&mut client, target_addr).await.unwrap();
    assert_eq!(reply, 0x00);

    client.write_all(b"last words").await.unwrap();
    drop(client);

    let received = tokio::time::timeout(TEST_TIMEOUT, seen_rx)
        .await
        .expect("target saw EOF once the client closed")
        .unwrap();
    assert_eq!(received, b"last words");
}

#[tokio::test]
async fn bad_tls_material_fails_startup_without_opening_public_port() {
    let tls = TlsMaterial::generate().unwrap();
    let mut config = test_config(&tls);
    config.admin.cert_path = tls.dir.path().join("missing.crt");

    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let public_addr = reserved.local_addr().unwrap();
    drop(reserved);
    config.mux.bind_addr = public_addr;

    let result = FrontDoor::start(config, Arc::new(Whitelist::new())).await;
    assert!(matches!(result, Err(StartupError::TlsMaterial { .. })));

    assert!(TcpStream::connect(public_addr).await.is_err());
}

#[tokio::test]
async fn occupied_backend_port_fails_startup() {
    let tls = TlsMaterial::generate().unwrap();
    let mut config = test_config(&tls);

    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    config.http.bind_addr = occupied.local_addr().unwrap();

    let result = FrontDoor::start(config, Arc::new(Whitelist::new())).await;
    match result {
        Err(StartupError::Bind { role, .. }) => assert_eq!(role, onedoor::BackendRole::Http),
        Err(other) => panic!("unexpected startup error: {other}"),
        Ok(_) => panic!("startup succeeded on an occupied port"),
    }
}
