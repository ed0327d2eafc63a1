use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{
    errors::{RestError, RestResult},
    types::ApiCredentials,
};

type HmacSha256 = Hmac<Sha256>;

/// Signs REST queries with the account's API secret.
#[derive(Clone)]
pub(crate) struct RequestSigner {
    credentials: ApiCredentials,
    recv_window_ms: u64,
}

impl RequestSigner {
    pub(crate) fn new(credentials: ApiCredentials, recv_window_ms: u64) -> Self {
        Self {
            credentials,
            recv_window_ms,
        }
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.credentials.api_key
    }

    /// Appends `recvWindow`, `timestamp` and `signature` to `query`.
    pub(crate) fn sign_query(&self, query: &str, timestamp_ms: i64) -> RestResult<String> {
        let mut payload = String::with_capacity(query.len() + 64);
        if !query.is_empty() {
            payload.push_str(query);
            payload.push('&');
        }
        payload.push_str(&format!(
            "recvWindow={}&timestamp={}",
            self.recv_window_ms, timestamp_ms
        ));
        let signature = self.signature(&payload)?;
        payload.push_str("&signature=");
        payload.push_str(&signature);
        Ok(payload)
    }

    fn signature(&self, payload: &str) -> RestResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|err| RestError::Signing(format!("failed to create signing key: {err}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
