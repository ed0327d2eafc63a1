use std::{path::Path, sync::Arc};

use super::{
    errors::{Error, Result},
    rest::RestClient,
};
use crate::{
    config::UserDataConfig,
    types::{AccountSnapshot, ApiCredentials, ListenKey},
    user_data::{LocalUserData, UserDataSources},
    ws_client::WsConnector,
};

/// Entry point wiring the REST and stream transports together.
pub struct ApxClient {
    rest: Arc<RestClient>,
    stream: Arc<WsConnector>,
    config: UserDataConfig,
}

impl ApxClient {
    /// Create a new builder used to configure an [`ApxClient`].
    pub fn builder() -> ApxClientBuilder {
        ApxClientBuilder {
            credentials: None,
            config: None,
        }
    }

    /// Construct a client with the default endpoints.
    pub fn new(credentials: ApiCredentials) -> Result<Self> {
        Self::with_config(credentials, UserDataConfig::default())
    }

    pub fn with_config(credentials: ApiCredentials, config: UserDataConfig) -> Result<Self> {
        if credentials.api_key.is_empty() {
            return Err(Error::InvalidConfig {
                field: "api_key",
                why: "must not be empty",
            });
        }
        if credentials.api_secret.is_empty() {
            return Err(Error::InvalidConfig {
                field: "api_secret",
                why: "must not be empty",
            });
        }
        config.validate()?;

        let rest = RestClient::new(
            &config.rest_url,
            credentials,
            config.recv_window_ms,
            config.http_timeout(),
        )?;
        let stream = WsConnector::new(&config.stream_url)?;
        Ok(Self {
            rest: Arc::new(rest),
            stream: Arc::new(stream),
            config,
        })
    }

    pub fn config(&self) -> &UserDataConfig {
        &self.config
    }

    /// Access the underlying REST transport.
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub async fn account(&self) -> Result<AccountSnapshot> {
        Ok(self.rest.account().await?)
    }

    pub async fn new_listen_key(&self) -> Result<ListenKey> {
        Ok(self.rest.new_listen_key().await?)
    }

    pub async fn keepalive_listen_key(&self, key: &ListenKey) -> Result<()> {
        Ok(self.rest.keepalive_listen_key(key).await?)
    }

    pub async fn close_listen_key(&self, key: &ListenKey) -> Result<()> {
        Ok(self.rest.delete_listen_key(key).await?)
    }

    /// Collaborators backing a [`LocalUserData`] built from this client.
    pub fn user_data_sources(&self) -> UserDataSources {
        UserDataSources::new(self.rest.clone(), self.rest.clone(), self.stream.clone())
    }

    /// Starts a locally mirrored account. Returns once the startup grace period has
    /// elapsed.
    pub async fn local_user_data(&self) -> Result<LocalUserData> {
        Ok(LocalUserData::start(self.user_data_sources(), self.config.clone()).await?)
    }
}

pub struct ApxClientBuilder {
    credentials: Option<ApiCredentials>,
    config: Option<UserDataConfig>,
}

impl ApxClientBuilder {
    pub fn credentials(mut self, credentials: ApiCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        self.credentials = Some(ApiCredentials::new(api_key, api_secret));
        self
    }

    pub fn config(mut self, config: UserDataConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads the configuration from a TOML file.
    pub fn config_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.config = Some(UserDataConfig::from_file(path)?);
        Ok(self)
    }

    pub fn rest_url(mut self, url: impl Into<String>) -> Self {
        self.config.get_or_insert_with(UserDataConfig::default).rest_url = url.into();
        self
    }

    pub fn stream_url(mut self, url: impl Into<String>) -> Self {
        self.config.get_or_insert_with(UserDataConfig::default).stream_url = url.into();
        self
    }

    pub fn build(self) -> Result<ApxClient> {
        let credentials = self
            .credentials
            .or_else(ApiCredentials::from_env)
            .ok_or(Error::InvalidConfig {
                field: "credentials",
                why: "must be provided or set via APX_API_KEY/APX_API_SECRET",
            })?;
        ApxClient::with_config(credentials, self.config.unwrap_or_default())
    }
}
