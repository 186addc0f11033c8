//! End-to-end exercises: an in-process gateway on port-0 listeners, a real
//! SSH client performing the remote-forward dance, and a canned local service
//! on the client's side of the tunnel.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use http_body_util::BodyExt as _;
use hyper::body::Bytes;
use hyper::{HeaderMap, StatusCode};
use hyper_util::rt::TokioIo;
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::keys::PublicKey;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

use tunneler::config::{Conf, Tls};
use tunneler::service::spawn_tasks;
use tunneler::AppState;

fn test_conf() -> Conf {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    let tls = Tls::init(
        vec![cert.der().clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
    )
    .unwrap();

    Conf {
        ssh_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        https_addr: "127.0.0.1:0".parse().unwrap(),
        hostname: "gateway.test".to_owned(),
        tls,
        host_key: russh::keys::PrivateKey::from(Ed25519Keypair::from_seed(&[7u8; 32])),
    }
}

/// Plain-HTTP service answering every connection with a canned 200. The
/// bind-time probe's ClientHello gets the same plaintext answer, which is
/// exactly the mismatch signal that downgrades the tunnel to `http`.
async fn start_upstream(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };

            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = stream.read(&mut buf).await;

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

/// Upgrade-capable variant: answers handshakes with a 101 and then echoes
/// raw bytes; anything else (including the probe) gets a plaintext 400.
async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };

            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();

                if head.contains("upgrade:") {
                    let handshake =
                        b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";
                    if stream.write_all(handshake).await.is_err() {
                        return;
                    }

                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                } else {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        )
                        .await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });

    addr
}

/// SSH client handler mirroring what `ssh -N -T -R…` does: every
/// `forwarded-tcpip` channel the server opens is wired to the local service.
struct ForwardClient {
    upstream: SocketAddr,
}

impl russh::client::Handler for ForwardClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<russh::client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        let upstream = self.upstream;

        // Never block the session handler with the copy loop itself.
        tokio::spawn(async move {
            match TcpStream::connect(upstream).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut channel_stream, &mut stream).await;
                    let _ = channel_stream.shutdown().await;
                }
                Err(_) => {
                    let _ = channel.close().await;
                }
            }
        });

        Ok(())
    }
}

async fn connect_ssh(
    ssh_addr: SocketAddr,
    upstream: SocketAddr,
) -> anyhow::Result<russh::client::Handle<ForwardClient>> {
    let config = Arc::new(russh::client::Config::default());
    let mut session = russh::client::connect(config, ssh_addr, ForwardClient { upstream })
        .await
        .context("SSH connect")?;

    let auth = session.authenticate_none("tunnel").await.context("SSH auth")?;
    anyhow::ensure!(auth.success(), "anonymous authentication should be accepted");

    Ok(session)
}

async fn http_request(
    addr: SocketAddr,
    method: &str,
    target: &str,
    headers: Vec<(&'static str, String)>,
    body: &str,
) -> (StatusCode, HeaderMap, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let mut builder = hyper::Request::builder()
        .method(method)
        .uri(target)
        .header(hyper::header::HOST, addr.to_string());
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(http_body_util::Full::new(Bytes::from(body.to_owned())))
        .unwrap();

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();

    (
        parts.status,
        parts.headers,
        String::from_utf8_lossy(&body).into_owned(),
    )
}

async fn create_tunnel(state: &AppState, upstream: SocketAddr) -> (String, String) {
    let (status, _, body) = http_request(
        state.bound.http,
        "PUT",
        "/tunnels",
        vec![("content-type", "application/json".to_owned())],
        &format!(r#"{{"LocalAddr":"{upstream}"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    let command = body["TunnelCommand"].as_str().unwrap().to_owned();

    let id = command
        .strip_prefix("ssh -N -T -R")
        .expect("command prefix")
        .split(':')
        .next()
        .expect("identifier before the first colon")
        .to_owned();

    (id, command)
}

/// Polls the proxy until the asynchronous bind+probe completes.
async fn await_tunnel_up(state: &AppState, id: &str) -> (StatusCode, String) {
    let mut last = (StatusCode::BAD_REQUEST, String::new());

    for _ in 0..100 {
        let (status, _, body) = http_request(
            state.bound.http,
            "GET",
            "/x",
            vec![("cookie", format!("TUNNELID={id}"))],
            "",
        )
        .await;
        last = (status, body);

        if last.0 == StatusCode::OK {
            break;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    last
}

#[tokio::test]
async fn round_trip_through_plain_http_upstream() -> anyhow::Result<()> {
    let (_tasks, state) = spawn_tasks(Arc::new(test_conf())).await?;
    let upstream = start_upstream("ok").await;

    let (id, command) = create_tunnel(&state, upstream).await;
    assert_eq!(id.len(), 26);
    assert_eq!(
        command,
        format!(
            "ssh -N -T -R{id}:8080:{upstream} gateway.test -p {}",
            state.bound.ssh.port()
        )
    );

    let mut session = connect_ssh(state.bound.ssh, upstream).await?;
    session
        .tcpip_forward(id.clone(), 8080)
        .await
        .context("forward request should be granted")?;

    let (status, body) = await_tunnel_up(&state, &id).await;
    assert_eq!(status, StatusCode::OK, "tunnel never came up: {body}");
    assert_eq!(body, "ok");

    // The probe saw a plaintext answer to its ClientHello.
    assert_eq!(
        state.tunnels.lookup(&id).unwrap().scheme,
        Some(tunneler::tunnel::Scheme::Http)
    );

    Ok(())
}

#[tokio::test]
async fn entry_url_sets_cookie_and_redirects() -> anyhow::Result<()> {
    let (_tasks, state) = spawn_tasks(Arc::new(test_conf())).await?;
    let upstream = start_upstream("ok").await;

    let (id, _) = create_tunnel(&state, upstream).await;

    let (status, headers, _) = http_request(
        state.bound.http,
        "GET",
        &format!("/tunnels/{id}/x?q=1"),
        vec![],
        "",
    )
    .await;

    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(headers["location"], "/x?q=1");

    let cookie = headers["set-cookie"].to_str()?;
    assert!(cookie.starts_with(&format!("TUNNELID={id}; ")));
    assert!(cookie.contains("SameSite=Strict"));

    Ok(())
}

#[tokio::test]
async fn cancel_makes_tunnel_unknown() -> anyhow::Result<()> {
    let (_tasks, state) = spawn_tasks(Arc::new(test_conf())).await?;
    let upstream = start_upstream("ok").await;

    let (id, _) = create_tunnel(&state, upstream).await;
    let mut session = connect_ssh(state.bound.ssh, upstream).await?;
    session
        .tcpip_forward(id.clone(), 8080)
        .await
        .context("forward request")?;

    let (status, _) = await_tunnel_up(&state, &id).await;
    assert_eq!(status, StatusCode::OK);

    session
        .cancel_tcpip_forward(id.clone(), 8080)
        .await
        .context("cancel request")?;

    let (status, _, body) = http_request(
        state.bound.http,
        "GET",
        "/x",
        vec![("cookie", format!("TUNNELID={id}"))],
        "",
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "tunnel not found");

    Ok(())
}

#[tokio::test]
async fn forward_for_unknown_tunnel_is_refused() -> anyhow::Result<()> {
    let (_tasks, state) = spawn_tasks(Arc::new(test_conf())).await?;
    let upstream = start_upstream("ok").await;

    let mut session = connect_ssh(state.bound.ssh, upstream).await?;

    assert!(
        session
            .tcpip_forward("nonexistent", 8080)
            .await
            .is_err(),
        "forward for an unregistered identifier must be refused"
    );

    Ok(())
}

#[tokio::test]
async fn concurrent_requests_use_independent_channels() -> anyhow::Result<()> {
    let (_tasks, state) = spawn_tasks(Arc::new(test_conf())).await?;
    let upstream = start_upstream("ok").await;

    let (id, _) = create_tunnel(&state, upstream).await;
    let mut session = connect_ssh(state.bound.ssh, upstream).await?;
    session
        .tcpip_forward(id.clone(), 8080)
        .await
        .context("forward request")?;

    let (status, _) = await_tunnel_up(&state, &id).await;
    assert_eq!(status, StatusCode::OK);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let http = state.bound.http;
        let cookie = format!("TUNNELID={id}");
        handles.push(tokio::spawn(async move {
            http_request(http, "GET", "/x", vec![("cookie", cookie)], "").await
        }));
    }

    for handle in handles {
        let (status, _, body) = handle.await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    Ok(())
}

#[tokio::test]
async fn upgrade_is_relayed_as_raw_bytes() -> anyhow::Result<()> {
    let (_tasks, state) = spawn_tasks(Arc::new(test_conf())).await?;
    let upstream = start_echo_upstream().await;

    let (id, _) = create_tunnel(&state, upstream).await;
    let mut session = connect_ssh(state.bound.ssh, upstream).await?;
    session
        .tcpip_forward(id.clone(), 8080)
        .await
        .context("forward request")?;

    // The echo upstream answers the probe with a plaintext 400, so the
    // tunnel binds as plain HTTP; wait for that before upgrading.
    let mut bound = false;
    for _ in 0..100 {
        if state
            .tunnels
            .lookup(&id)
            .is_some_and(|tunnel| tunnel.conn.is_some() && tunnel.scheme.is_some())
        {
            bound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(bound, "tunnel never bound");

    let stream = TcpStream::connect(state.bound.http).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let conn = tokio::spawn(conn.with_upgrades());

    let request = hyper::Request::builder()
        .method("GET")
        .uri("/ws")
        .header(hyper::header::HOST, state.bound.http.to_string())
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "echo")
        .header(hyper::header::COOKIE, format!("TUNNELID={id}"))
        .body(http_body_util::Full::new(Bytes::new()))?;

    let mut response = sender.send_request(request).await?;
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    let upgraded = hyper::upgrade::on(&mut response).await?;
    let mut io = TokioIo::new(upgraded);

    for message in [&b"hello tunnel"[..], &b"second message"[..]] {
        io.write_all(message).await?;
        io.flush().await?;

        let mut echoed = vec![0u8; message.len()];
        io.read_exact(&mut echoed).await?;
        assert_eq!(echoed, message);
    }

    io.shutdown().await?;
    drop(io);
    conn.abort();

    Ok(())
}

#[tokio::test]
async fn https_listener_serves_the_api() -> anyhow::Result<()> {
    let (_tasks, state) = spawn_tasks(Arc::new(test_conf())).await?;

    let stream = TcpStream::connect(state.bound.https).await?;
    let tls_stream = tunneler::tls::connect("localhost", stream).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream)).await?;
    tokio::spawn(conn);

    let request = hyper::Request::builder()
        .method("PUT")
        .uri("/tunnels")
        .header(hyper::header::HOST, state.bound.https.to_string())
        .body(http_body_util::Full::new(Bytes::from(
            r#"{"LocalAddr":"127.0.0.1:9443"}"#,
        )))?;

    let response = sender.send_request(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await?.to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&body)?;
    assert!(body["TunnelCommand"].as_str().unwrap().starts_with("ssh -N -T -R"));

    // The cookie set by the TLS listener is marked Secure.
    let id = body["URLs"][0]
        .as_str()
        .unwrap()
        .rsplit('/')
        .nth(1)
        .unwrap()
        .to_owned();

    let stream = TcpStream::connect(state.bound.https).await?;
    let tls_stream = tunneler::tls::connect("localhost", stream).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream)).await?;
    tokio::spawn(conn);

    let request = hyper::Request::builder()
        .method("GET")
        .uri(format!("/tunnels/{id}/"))
        .header(hyper::header::HOST, state.bound.https.to_string())
        .body(http_body_util::Full::new(Bytes::new()))?;

    let response = sender.send_request(request).await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(response.headers()["set-cookie"]
        .to_str()?
        .contains("Secure"));

    Ok(())
}
