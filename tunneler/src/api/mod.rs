pub mod proxy;
pub mod tunnels;

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::{Extension, Router};

use crate::listener::ServedBy;
use crate::AppState;

pub fn make_router(state: AppState) -> Router {
    Router::new()
        .route("/tunnels", put(tunnels::create_tunnel))
        .fallback(dispatch)
        .with_state(state)
}

/// Everything except `/tunnels` itself: requests carrying an identifier in
/// the path land on the entry handler, the rest is proxied by cookie.
async fn dispatch(
    State(state): State<AppState>,
    Extension(served_by): Extension<ServedBy>,
    request: Request,
) -> Response {
    if let Some(rest) = request.uri().path().strip_prefix("/tunnels/") {
        let id = &rest[..rest.find('/').unwrap_or(rest.len())];
        let id = id.to_owned();

        tunnels::enter_tunnel(state, served_by, id, request)
            .await
            .into_response()
    } else {
        proxy::proxy_request(state, request).await.into_response()
    }
}
