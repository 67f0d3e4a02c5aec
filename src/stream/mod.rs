//! WebSocket subsystem: public market data (B), private account stream (C),
//! and the trade-submission channel (D). Each connects independently over
//! `tokio_tungstenite`, one reader task per socket.

pub mod private;
pub mod public;
pub mod trade;

pub use private::PrivateStream;
pub use public::PublicStream;
pub use trade::TradeChannel;

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::BybitCredentials;
use crate::error::{FunError, FunResult};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type HmacSha256 = Hmac<Sha256>;

/// Bybit v5 WS auth frame: HMAC-SHA256 over `GET/realtime{expires_ms}`,
/// shared by the private account stream and the trade-submission channel
/// since both authenticate the same way.
pub(crate) fn ws_auth_message(creds: &BybitCredentials) -> FunResult<String> {
    let expires_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
        + 10_000;

    let payload = format!("GET/realtime{expires_ms}");
    let mut mac = HmacSha256::new_from_slice(creds.api_secret.as_bytes())
        .map_err(|e| FunError::config(format!("invalid API secret: {e}")))?;
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let auth = serde_json::json!({
        "op": "auth",
        "args": [creds.api_key, expires_ms, signature],
    });
    Ok(auth.to_string())
}
