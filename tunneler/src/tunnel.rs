use core::fmt;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::local_addr::LocalAddr;

/// z-base-32, the permutation chosen for human transcription. The alphabet is
/// part of the wire contract: IDs must come out identical regardless of the
/// generating implementation.
const ZBASE32_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

/// 128 bits in 5-bit groups, last group zero-padded.
pub const TUNNEL_ID_LEN: usize = 26;

/// Port the `-R` clause advertises; accepted from clients but never used for
/// dispatch (the identifier is authoritative).
pub const FORWARD_BIND_PORT: u32 = 8080;

fn encode_zbase32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut acc: u16 = 0;
    let mut acc_bits: u8 = 0;

    for &byte in bytes {
        acc = (acc << 8) | u16::from(byte);
        acc_bits += 8;

        while acc_bits >= 5 {
            acc_bits -= 5;
            let index = (acc >> acc_bits) & 0x1f;
            out.push(ZBASE32_ALPHABET[usize::from(index)] as char);
        }
    }

    if acc_bits > 0 {
        let index = (acc << (5 - acc_bits)) & 0x1f;
        out.push(ZBASE32_ALPHABET[usize::from(index)] as char);
    }

    out
}

#[derive(Debug, PartialEq, Eq)]
pub enum BadTunnelId {
    BadLength { len: usize },
    BadCharacter { c: char },
}

impl fmt::Display for BadTunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadTunnelId::BadLength { len } => write!(f, "bad identifier length: {len}"),
            BadTunnelId::BadCharacter { c } => write!(f, "bad identifier character: {c:?}"),
        }
    }
}

impl std::error::Error for BadTunnelId {}

/// 26-character tunnel identifier.
///
/// Lookups are byte-exact: identifiers are never case-folded or otherwise
/// normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelId(String);

impl TunnelId {
    pub fn generate() -> Self {
        TunnelId(encode_zbase32(Uuid::new_v4().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TunnelId {
    type Err = BadTunnelId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TUNNEL_ID_LEN {
            return Err(BadTunnelId::BadLength { len: s.len() });
        }

        if let Some(c) = s.chars().find(|c| {
            !c.is_ascii() || !ZBASE32_ALPHABET.contains(&(*c as u8))
        }) {
            return Err(BadTunnelId::BadCharacter { c });
        }

        Ok(TunnelId(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// Back-reference to the SSH session that owns a tunnel. The accept loop
/// owns the connection itself; handle operations fail once it is gone.
#[derive(Clone)]
pub struct SshConn {
    pub handle: russh::server::Handle,
    pub peer_addr: std::net::SocketAddr,
}

/// One registered tunnel. Proxyable only when both `conn` and `scheme` are
/// set.
#[derive(Clone)]
pub struct Tunnel {
    pub local_addr: LocalAddr,
    pub scheme: Option<Scheme>,
    pub conn: Option<SshConn>,
}

/// Process-wide identifier → tunnel map.
///
/// The lock is held only across the map operation itself, never across
/// channel opens or proxied traffic.
#[derive(Clone, Default)]
pub struct TunnelStore {
    inner: Arc<Mutex<HashMap<String, Tunnel>>>,
}

impl TunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &TunnelId, local_addr: LocalAddr) {
        self.inner.lock().insert(
            id.as_str().to_owned(),
            Tunnel {
                local_addr,
                scheme: None,
                conn: None,
            },
        );
    }

    /// Attaches an SSH session to the tunnel. Returns `false` when the
    /// identifier is no longer registered.
    pub fn bind(&self, id: &str, conn: SshConn) -> bool {
        match self.inner.lock().get_mut(id) {
            Some(tunnel) => {
                tunnel.conn = Some(conn);
                true
            }
            None => false,
        }
    }

    pub fn set_scheme(&self, id: &str, scheme: Scheme) -> bool {
        match self.inner.lock().get_mut(id) {
            Some(tunnel) => {
                tunnel.scheme = Some(scheme);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Tunnel> {
        self.inner.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }
}
