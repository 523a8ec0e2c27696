use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::future::Future;
use tracing::debug;
use url::Url;

use crate::cache::Params;
use crate::config::Config;

/// Anything that can fetch a resource from the server.
///
/// The cache never calls this itself; views and the cached client use it on
/// a cache miss.
pub trait ApiGateway: Clone + Send + Sync + 'static {
  fn fetch(
    &self,
    resource: &str,
    params: Option<&Params>,
  ) -> impl Future<Output = Result<Value>> + Send;
}

/// HTTP gateway: `GET {base_url}/{resource}?{params}` returning JSON.
#[derive(Clone)]
pub struct HttpGateway {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpGateway {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Self::with_client(client, base_url, token)
  }

  /// Use a preconfigured `reqwest` client.
  pub fn with_client(
    client: reqwest::Client,
    base_url: &str,
    token: Option<String>,
  ) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Invalid API base URL {}: cannot carry a path", base_url));
    }

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Self::new(&config.api.base_url, Config::get_api_token())
  }

  /// Build the request URL for a resource query.
  ///
  /// String parameters are sent as-is, everything else as compact JSON.
  pub fn resource_url(&self, resource: &str, params: Option<&Params>) -> Result<Url> {
    let mut url = self.base_url.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| eyre!("Invalid API base URL {}", self.base_url))?;
      segments
        .pop_if_empty()
        .extend(resource.split('/').filter(|s| !s.is_empty()));
    }

    if let Some(params) = params.filter(|p| !p.is_empty()) {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in params {
        pairs.append_pair(name, &query_value(value));
      }
    }

    Ok(url)
  }
}

fn query_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

impl ApiGateway for HttpGateway {
  async fn fetch(&self, resource: &str, params: Option<&Params>) -> Result<Value> {
    let url = self.resource_url(resource, params)?;
    debug!(url = %url, "Fetching resource");

    let mut request = self.client.get(url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", resource, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Failed to fetch {}: server returned {}", resource, status));
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read {} response: {}", resource, e))?;

    serde_json::from_slice(&body).map_err(|e| eyre!("Failed to parse {} response: {}", resource, e))
  }
}
