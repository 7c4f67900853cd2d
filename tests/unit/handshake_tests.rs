//! Unit tests for the WebSocket opening handshake.

use axum::http::{header, HeaderMap, HeaderValue};

use agent_console::ws::handshake::{accept_token, UpgradeRequest};
use agent_console::AppError;

fn upgrade_headers(key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        header::SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(key).expect("header value"),
    );
    headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    headers
}

/// The sample key from the protocol RFC yields its published accept token.
#[test]
fn accept_token_matches_rfc_example() {
    assert_eq!(
        accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
}

/// A valid upgrade produces the 101 headers with the computed token.
#[test]
fn valid_upgrade_builds_response_headers() {
    let request =
        UpgradeRequest::from_headers(&upgrade_headers("dGhlIHNhbXBsZSBub25jZQ==")).expect("valid");
    let headers = request.response_headers().expect("headers");

    assert_eq!(headers[header::UPGRADE], "websocket");
    assert_eq!(headers[header::CONNECTION], "Upgrade");
    assert_eq!(
        headers[header::SEC_WEBSOCKET_ACCEPT],
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
    assert!(headers.get(header::SEC_WEBSOCKET_PROTOCOL).is_none());
}

/// The first offered subprotocol is echoed back.
#[test]
fn first_subprotocol_is_echoed() {
    let mut headers = upgrade_headers("abc");
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static("tty, other"),
    );
    let request = UpgradeRequest::from_headers(&headers).expect("valid");
    assert_eq!(request.protocol.as_deref(), Some("tty"));
    assert_eq!(
        request.response_headers().expect("headers")[header::SEC_WEBSOCKET_PROTOCOL],
        "tty"
    );
}

/// The upgrade token is matched case-insensitively inside a list.
#[test]
fn upgrade_token_is_case_insensitive() {
    let mut headers = upgrade_headers("abc");
    headers.insert(header::UPGRADE, HeaderValue::from_static("h2c, WebSocket"));
    assert!(UpgradeRequest::from_headers(&headers).is_ok());
}

/// Requests without a key or without the upgrade header are refused.
#[test]
fn missing_key_or_upgrade_is_rejected() {
    let mut no_key = upgrade_headers("abc");
    no_key.remove(header::SEC_WEBSOCKET_KEY);
    assert!(matches!(
        UpgradeRequest::from_headers(&no_key),
        Err(AppError::Protocol(_))
    ));

    let mut no_upgrade = upgrade_headers("abc");
    no_upgrade.remove(header::UPGRADE);
    assert!(matches!(
        UpgradeRequest::from_headers(&no_upgrade),
        Err(AppError::Protocol(_))
    ));
}
