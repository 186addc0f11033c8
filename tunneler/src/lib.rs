#[macro_use]
extern crate tracing;

pub mod api;
pub mod config;
pub mod http;
pub mod listener;
pub mod local_addr;
pub mod log;
pub mod proxy;
pub mod service;
pub mod ssh;
pub mod tls;
pub mod transport;
pub mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Conf;
use crate::tunnel::TunnelStore;

/// Addresses the three listeners actually bound to, resolved at startup.
///
/// Access URLs and the suggested `ssh` command are derived from these rather
/// than from the configured addresses, so that `:0` listeners advertise their
/// real ports.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub ssh: SocketAddr,
    pub http: SocketAddr,
    pub https: SocketAddr,
}

#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub tunnels: TunnelStore,
    pub bound: BoundAddrs,
}

pub fn make_http_service(state: AppState) -> axum::Router {
    api::make_router(state)
}
