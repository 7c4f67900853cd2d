//! WebSocket opening handshake.
//!
//! The accept token is `base64(SHA-1(key ++ GUID))` as fixed by the
//! protocol. Header validation is kept separate from the HTTP framework so
//! it can be tested with plain header maps.

use axum::http::{header, HeaderMap, HeaderValue};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::{AppError, Result};

/// Magic constant appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Computed `Sec-WebSocket-Accept` value.
    pub accept: String,
    /// First subprotocol offered by the client, echoed back when present.
    pub protocol: Option<String>,
}

impl UpgradeRequest {
    /// Validate upgrade headers and compute the accept token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when the request is not a WebSocket
    /// upgrade or carries no `Sec-WebSocket-Key`.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let upgrade = header_str(headers, &header::UPGRADE).unwrap_or_default();
        if !upgrade
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        {
            return Err(AppError::Protocol("missing upgrade: websocket header".into()));
        }

        let key = header_str(headers, &header::SEC_WEBSOCKET_KEY)
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| AppError::Protocol("missing sec-websocket-key header".into()))?;

        let protocol = header_str(headers, &header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned);

        Ok(Self {
            accept: accept_token(key),
            protocol,
        })
    }

    /// Headers for the `101 Switching Protocols` response.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the echoed subprotocol is not a
    /// valid header value.
    pub fn response_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_str(&self.accept)
                .map_err(|err| AppError::Protocol(format!("invalid accept token: {err}")))?,
        );
        if let Some(ref protocol) = self.protocol {
            headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(protocol)
                    .map_err(|err| AppError::Protocol(format!("invalid subprotocol: {err}")))?,
            );
        }
        Ok(headers)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
