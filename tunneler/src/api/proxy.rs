use axum::extract::Request;
use axum::http::{header, HeaderMap};
use axum::response::Response;

use crate::api::tunnels::TUNNEL_ID_COOKIE;
use crate::http::HttpError;
use crate::proxy::ProxyBridge;
use crate::transport::ChannelTransport;
use crate::tunnel::FORWARD_BIND_PORT;
use crate::AppState;

/// Catch-all: resolves the session cookie to a tunnel, opens a dedicated
/// `forwarded-tcpip` channel and relays the request through it.
pub(crate) async fn proxy_request(state: AppState, request: Request) -> Result<Response, HttpError> {
    debug!(host = ?request.headers().get(header::HOST), uri = %request.uri(), "handling proxy request");

    let Some(id) = tunnel_id_cookie(request.headers()) else {
        return Err(HttpError::not_found().msg("not found"));
    };

    let Some(tunnel) = state.tunnels.lookup(&id) else {
        return Err(HttpError::bad_request().msg("tunnel not found"));
    };

    // Both come out of a completed bind; a tunnel that is still waiting for
    // its SSH side is not reachable.
    let (Some(conn), Some(scheme)) = (tunnel.conn, tunnel.scheme) else {
        return Err(HttpError::bad_request().msg("tunnel not found"));
    };

    let channel = conn
        .handle
        .channel_open_forwarded_tcpip(id.as_str(), FORWARD_BIND_PORT, "", 0)
        .await
        .map_err(HttpError::internal().with_msg("failed to open SSH tunnel").err())?;

    ProxyBridge::builder()
        .transport(ChannelTransport::new(channel, conn.peer_addr))
        .tunnel_id(id)
        .local_addr(tunnel.local_addr)
        .scheme(scheme)
        .request(request)
        .build()
        .run()
        .await
}

fn tunnel_id_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == TUNNEL_ID_COOKIE && !value.is_empty()).then(|| value.to_owned())
        })
}
