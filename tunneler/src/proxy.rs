use anyhow::Context as _;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tunneler_task::ChildTask;
use typed_builder::TypedBuilder;

use crate::http::HttpError;
use crate::local_addr::LocalAddr;
use crate::tls;
use crate::transport::ChannelTransport;
use crate::tunnel::Scheme;

/// Removes the first occurrence of `/tunnels/<id>` from the path and returns
/// the remaining origin-form target, query preserved. An empty remainder is
/// the root.
pub(crate) fn strip_tunnel_prefix(uri: &Uri, id: &str) -> String {
    let prefix = format!("/tunnels/{id}");

    let path = uri.path();
    let path = path.strip_prefix(prefix.as_str()).unwrap_or(path);
    let path = if path.is_empty() { "/" } else { path };

    match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    }
}

/// Rewrites an inbound request for the local service: prefix stripped,
/// `Host` replaced with the advertised local address. The standard relay
/// additionally forces `Connection: close` (one channel per request) and
/// drops `Accept-Encoding` so bodies come back uncompressed; the raw relay
/// for upgrades keeps the hop headers intact so the handshake survives.
///
/// Returns the client-side upgrade handle when the server provides one.
pub(crate) fn build_outbound(
    mut request: Request,
    id: &str,
    local_addr: &LocalAddr,
    for_upgrade: bool,
) -> anyhow::Result<(hyper::Request<Body>, Option<OnUpgrade>)> {
    let on_upgrade = request.extensions_mut().remove::<OnUpgrade>();

    let target = strip_tunnel_prefix(request.uri(), id);

    let (mut parts, body) = request.into_parts();

    parts.uri = target.parse::<Uri>().context("outbound request target")?;
    parts.headers.insert(
        header::HOST,
        HeaderValue::from_str(local_addr.as_str()).context("local address as Host header")?,
    );

    if !for_upgrade {
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        parts.headers.remove(header::ACCEPT_ENCODING);
    }

    Ok((hyper::Request::from_parts(parts, body), on_upgrade))
}

/// Speaks HTTP/1.1 over the given transport: one handshake, one request, the
/// connection task detached so the response body can stream. Channel lifetime
/// equals request lifetime — the transport is dropped when the connection
/// task completes.
async fn drive<T>(io: T, request: hyper::Request<Body>) -> anyhow::Result<hyper::Response<Incoming>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake(TokioIo::new(io))
        .await
        .context("HTTP handshake over tunnel channel")?;

    ChildTask::spawn(async move {
        if let Err(error) = conn.with_upgrades().await {
            debug!(%error, "tunnel channel connection ended");
        }
    })
    .detach();

    sender.send_request(request).await.context("request over tunnel channel")
}

async fn send_over_channel(
    transport: ChannelTransport,
    scheme: Scheme,
    host: &str,
    request: hyper::Request<Body>,
) -> anyhow::Result<hyper::Response<Incoming>> {
    match scheme {
        Scheme::Https => {
            let tls_stream = tls::connect(host, transport)
                .await
                .context("TLS connect to local service")?;
            drive(tls_stream, request).await
        }
        Scheme::Http => drive(transport, request).await,
    }
}

/// Determines whether the local service behind a fresh channel speaks HTTPS
/// or plain HTTP, by attempting a TLS session and issuing a HEAD request.
/// A plaintext answer to the ClientHello is the mismatch signal; any HTTPS
/// response, whatever the status, confirms HTTPS.
pub(crate) async fn probe_scheme(
    transport: ChannelTransport,
    local_addr: &LocalAddr,
) -> anyhow::Result<Scheme> {
    match tls::connect(local_addr.host(), transport).await {
        Ok(tls_stream) => {
            let request = hyper::Request::builder()
                .method(Method::HEAD)
                .uri("/")
                .header(header::HOST, local_addr.as_str())
                .header(header::CONNECTION, "close")
                .body(Body::empty())
                .context("probe request")?;

            let response = drive(tls_stream, request).await.context("HTTPS probe")?;
            debug!(status = %response.status(), "local service answered the HTTPS probe");

            Ok(Scheme::Https)
        }
        Err(error) if tls::is_plaintext_reply(&error) => {
            debug!("local service is running plain HTTP");
            Ok(Scheme::Http)
        }
        Err(error) => Err(anyhow::Error::new(error).context("failed to probe local service")),
    }
}

/// One proxied request over its dedicated `forwarded-tcpip` channel.
#[derive(TypedBuilder)]
pub(crate) struct ProxyBridge {
    transport: ChannelTransport,
    tunnel_id: String,
    local_addr: LocalAddr,
    scheme: Scheme,
    request: Request,
}

impl ProxyBridge {
    #[instrument(name = "bridge", skip_all, fields(tunnel = %self.tunnel_id, peer = %self.transport.peer_addr()))]
    pub(crate) async fn run(self) -> Result<axum::response::Response, HttpError> {
        let Self {
            transport,
            tunnel_id,
            local_addr,
            scheme,
            request,
        } = self;

        let wants_upgrade = request.headers().contains_key(header::UPGRADE);

        let (outbound, client_upgrade) =
            build_outbound(request, &tunnel_id, &local_addr, wants_upgrade)
                .map_err(HttpError::internal().with_msg("failed to create request").err())?;

        if wants_upgrade {
            let Some(client_upgrade) = client_upgrade else {
                return Err(HttpError::internal().msg("connection cannot be hijacked"));
            };

            // The handshake is serialized onto the bare channel; whatever the
            // local service answers is relayed back, and a 101 flips both
            // sides into a raw byte relay.
            let mut response = drive(transport, outbound)
                .await
                .map_err(HttpError::internal().with_msg("request failed").err())?;

            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                ChildTask::spawn(relay_upgraded(client_upgrade, upstream_upgrade)).detach();
            }

            Ok(response.map(Body::new))
        } else {
            let response = send_over_channel(transport, scheme, local_addr.host(), outbound)
                .await
                .map_err(HttpError::internal().with_msg("request failed").err())?;

            // Status, headers and body are relayed verbatim.
            Ok(response.map(Body::new))
        }
    }
}

async fn relay_upgraded(client: OnUpgrade, upstream: OnUpgrade) {
    use tokio::io::AsyncWriteExt as _;

    match futures::future::try_join(client, upstream).await {
        Ok((client_io, upstream_io)) => {
            let mut client_io = TokioIo::new(client_io);
            let mut upstream_io = TokioIo::new(upstream_io);

            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                Ok((to_upstream, to_client)) => {
                    debug!(to_upstream, to_client, "upgraded relay finished");
                }
                Err(error) => warn!(%error, "copy failed"),
            }

            let _ = client_io.shutdown().await;
            let _ = upstream_io.shutdown().await;
        }
        Err(error) => error!(%error, "upgrade completion failed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    const ID: &str = "yyyyyyyyyyyyyyyyyyyyyyyyyy";

    #[rstest]
    #[case("/tunnels/yyyyyyyyyyyyyyyyyyyyyyyyyy/a/b?q=1", "/a/b?q=1")]
    #[case("/tunnels/yyyyyyyyyyyyyyyyyyyyyyyyyy", "/")]
    #[case("/tunnels/yyyyyyyyyyyyyyyyyyyyyyyyyy/", "/")]
    #[case("/a/b", "/a/b")]
    #[case("/a/tunnels/yyyyyyyyyyyyyyyyyyyyyyyyyy/b", "/a/tunnels/yyyyyyyyyyyyyyyyyyyyyyyyyy/b")]
    fn prefix_stripping(#[case] uri: &str, #[case] expected: &str) {
        let uri = uri.parse::<Uri>().unwrap();
        assert_eq!(strip_tunnel_prefix(&uri, ID), expected);
    }

    fn request_builder() -> axum::http::request::Builder {
        axum::http::Request::builder()
    }

    #[test]
    fn outbound_request_for_standard_relay() {
        let local_addr = LocalAddr::parse("127.0.0.1:9443").unwrap();

        let request = request_builder()
            .method("POST")
            .uri(format!("/tunnels/{ID}/submit?x=2"))
            .header(header::HOST, "gateway.example")
            .header(header::ACCEPT_ENCODING, "gzip")
            .header("x-custom", "kept")
            .body(Body::empty())
            .unwrap();

        let (outbound, on_upgrade) = build_outbound(request, ID, &local_addr, false).unwrap();

        assert!(on_upgrade.is_none());
        assert_eq!(outbound.uri(), "/submit?x=2");
        assert_eq!(outbound.headers()[header::HOST], "127.0.0.1:9443");
        assert_eq!(outbound.headers()[header::CONNECTION], "close");
        assert!(outbound.headers().get(header::ACCEPT_ENCODING).is_none());
        assert_eq!(outbound.headers()["x-custom"], "kept");
    }

    #[test]
    fn outbound_request_for_upgrade_keeps_hop_headers() {
        let local_addr = LocalAddr::parse("127.0.0.1:9000").unwrap();

        let request = request_builder()
            .uri("/ws")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();

        let (outbound, _) = build_outbound(request, ID, &local_addr, true).unwrap();

        assert_eq!(outbound.uri(), "/ws");
        assert_eq!(outbound.headers()[header::CONNECTION], "Upgrade");
        assert_eq!(outbound.headers()[header::UPGRADE], "websocket");
    }
}
