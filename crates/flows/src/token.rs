use remixctl_browser::OutboundRequest;
use std::time::Duration;
use tokio::sync::mpsc;

const MIN_TOKEN_LEN: usize = 16;

/// Token characters allowed by RFC 6750 (`b64token`).
pub fn is_well_formed_token(token: &str) -> bool {
    token.len() >= MIN_TOKEN_LEN
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '+' | '/' | '='))
}

/// Bearer token from a request's `Authorization` header, if it carries a
/// well-formed one.
pub fn extract_bearer(request: &OutboundRequest) -> Option<String> {
    let value = request.header("authorization")?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    is_well_formed_token(token).then(|| token.to_string())
}

/// First well-formed bearer token seen on `requests` within `timeout`.
pub async fn first_bearer(
    requests: &mut mpsc::UnboundedReceiver<OutboundRequest>,
    timeout: Duration,
) -> Option<String> {
    let scan = async {
        while let Some(request) = requests.recv().await {
            if let Some(token) = extract_bearer(&request) {
                return Some(token);
            }
        }
        None
    };
    tokio::time::timeout(timeout, scan).await.ok().flatten()
}
