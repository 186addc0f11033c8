use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::http::HttpError;
use crate::listener::ServedBy;
use crate::local_addr::LocalAddr;
use crate::proxy::strip_tunnel_prefix;
use crate::tunnel::{TunnelId, FORWARD_BIND_PORT};
use crate::AppState;

pub(crate) const TUNNEL_ID_COOKIE: &str = "TUNNELID";

const COOKIE_MAX_AGE_SECS: u32 = 3600;

#[derive(Debug, Deserialize)]
struct TunnelCreateReq {
    #[serde(rename = "LocalAddr")]
    local_addr: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TunnelCreateRes {
    #[serde(rename = "TunnelCommand")]
    tunnel_command: String,
    #[serde(rename = "URLs")]
    urls: Vec<String>,
}

/// Registers a tunnel and hands back the command to run and the access URLs.
pub(crate) async fn create_tunnel(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TunnelCreateRes>, HttpError> {
    let req: TunnelCreateReq = serde_json::from_slice(&body)
        .map_err(HttpError::bad_request().with_msg("bad request").err())?;

    let local_addr = LocalAddr::parse(&req.local_addr)
        .map_err(HttpError::bad_request().with_msg("invalid LocalAddr").err())?;

    let id = TunnelId::generate();
    state.tunnels.insert(&id, local_addr.clone());

    info!(tunnel = %id, local_addr = %local_addr, "tunnel created");

    Ok(Json(TunnelCreateRes {
        tunnel_command: generate_tunnel_command(
            &id,
            &local_addr,
            &state.conf.hostname,
            state.bound.ssh.port(),
        ),
        urls: generate_access_urls(&id, state.bound.http, state.bound.https),
    }))
}

fn generate_tunnel_command(
    id: &TunnelId,
    local_addr: &LocalAddr,
    hostname: &str,
    ssh_port: u16,
) -> String {
    format!(
        "ssh -N -T -R{id}:{FORWARD_BIND_PORT}:{} {hostname} -p {ssh_port}",
        local_addr.command_form()
    )
}

fn generate_access_urls(id: &TunnelId, http_addr: SocketAddr, https_addr: SocketAddr) -> Vec<String> {
    vec![
        format!("http://{http_addr}/tunnels/{id}/"),
        format!("https://{https_addr}/tunnels/{id}/"),
    ]
}

/// Landing handler for access URLs: pins the session to the tunnel with a
/// cookie and bounces the client to the same path without the identifier
/// prefix.
pub(crate) async fn enter_tunnel(
    state: AppState,
    served_by: ServedBy,
    id: String,
    request: Request,
) -> Result<Response, HttpError> {
    debug!(host = ?request.headers().get(header::HOST), uri = %request.uri(), "handling entry request");

    if state.tunnels.lookup(&id).is_none() {
        return Err(HttpError::bad_request().msg("tunnel not found"));
    }

    let location = strip_tunnel_prefix(request.uri(), &id);
    let cookie = session_cookie(&id, served_by);

    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, location), (header::SET_COOKIE, cookie)],
    )
        .into_response())
}

fn session_cookie(id: &str, served_by: ServedBy) -> String {
    let mut cookie = format!(
        "{TUNNEL_ID_COOKIE}={id}; Path=/; Domain={}; Max-Age={COOKIE_MAX_AGE_SECS}; HttpOnly; SameSite=Strict",
        served_by.addr.ip()
    );

    if served_by.tls {
        cookie.push_str("; Secure");
    }

    cookie
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn command_shape() {
        let id = TunnelId::generate();
        let local_addr = LocalAddr::parse("127.0.0.1:9443").unwrap();

        assert_eq!(
            generate_tunnel_command(&id, &local_addr, "gw.example", 2222),
            format!("ssh -N -T -R{id}:8080:127.0.0.1:9443 gw.example -p 2222")
        );

        let portless = LocalAddr::parse("example.com").unwrap();
        assert_eq!(
            generate_tunnel_command(&id, &portless, "gw.example", 22),
            format!("ssh -N -T -R{id}:8080:example.com:443 gw.example -p 22")
        );
    }

    #[test]
    fn access_urls_point_at_both_listeners() {
        let id = TunnelId::generate();
        let urls = generate_access_urls(
            &id,
            "127.0.0.1:8080".parse().unwrap(),
            "127.0.0.1:8443".parse().unwrap(),
        );

        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], format!("http://127.0.0.1:8080/tunnels/{id}/"));
        assert_eq!(urls[1], format!("https://127.0.0.1:8443/tunnels/{id}/"));
    }
}
