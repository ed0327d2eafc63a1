use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use url::Url;

use super::auth::RequestSigner;
use crate::{
    errors::{RestError, RestResult},
    types::{AccountSnapshot, ApiCredentials, ListenKey},
    user_data::{ListenKeyProvider, SnapshotSource},
};

const ACCOUNT_PATH: &str = "fapi/v2/account";
const LISTEN_KEY_PATH: &str = "fapi/v1/listenKey";

/// How much authentication a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    /// API key header only.
    KeyOnly,
    /// API key header plus a signed query.
    Signed,
}

/// Thin wrapper around the futures REST endpoints the mirror depends on.
pub struct RestClient {
    http: Client,
    base: Url,
    signer: RequestSigner,
}

impl RestClient {
    pub(crate) fn new(
        base_url: &str,
        credentials: ApiCredentials,
        recv_window_ms: u64,
        timeout: Duration,
    ) -> RestResult<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            signer: RequestSigner::new(credentials, recv_window_ms),
        })
    }

    pub(crate) fn base_path(&self) -> &str {
        self.base.as_str()
    }

    pub async fn account(&self) -> RestResult<AccountSnapshot> {
        self.request_json(Method::GET, ACCOUNT_PATH, &[], Auth::Signed)
            .await
    }

    pub async fn new_listen_key(&self) -> RestResult<ListenKey> {
        self.request_json(Method::POST, LISTEN_KEY_PATH, &[], Auth::KeyOnly)
            .await
    }

    pub async fn keepalive_listen_key(&self, key: &ListenKey) -> RestResult<()> {
        self.request(
            Method::PUT,
            LISTEN_KEY_PATH,
            &[("listenKey", key.as_str())],
            Auth::KeyOnly,
        )
        .await
        .map(|_| ())
    }

    pub async fn delete_listen_key(&self, key: &ListenKey) -> RestResult<()> {
        self.request(
            Method::DELETE,
            LISTEN_KEY_PATH,
            &[("listenKey", key.as_str())],
            Auth::KeyOnly,
        )
        .await
        .map(|_| ())
    }

    async fn request_json<T>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        auth: Auth,
    ) -> RestResult<T>
    where
        T: DeserializeOwned,
    {
        let body = self.request(method, path, params, auth).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        auth: Auth,
    ) -> RestResult<String> {
        let url = self.url(path, params, auth)?;
        let response = self
            .http
            .request(method, url)
            .header("Accept", "application/json")
            .header("X-MBX-APIKEY", self.signer.api_key())
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RestError::with_http_status(status, &body));
        }
        Ok(body)
    }

    fn url(&self, path: &str, params: &[(&str, &str)], auth: Auth) -> RestResult<Url> {
        let mut url = self.base.join(path.trim_start_matches('/'))?;
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        let query = match auth {
            Auth::Signed => self
                .signer
                .sign_query(&query, Utc::now().timestamp_millis())?,
            Auth::KeyOnly => query,
        };
        if !query.is_empty() {
            url.set_query(Some(&query));
        }
        Ok(url)
    }
}

#[async_trait]
impl SnapshotSource for RestClient {
    async fn fetch_account(&self) -> RestResult<AccountSnapshot> {
        self.account().await
    }
}

#[async_trait]
impl ListenKeyProvider for RestClient {
    async fn acquire(&self) -> RestResult<ListenKey> {
        self.new_listen_key().await
    }

    async fn renew(&self, key: &ListenKey) -> RestResult<()> {
        self.keepalive_listen_key(key).await
    }

    async fn release(&self, key: &ListenKey) -> RestResult<()> {
        self.delete_listen_key(key).await
    }
}
