//! Session lifecycle: owns the request cache for one signed-in identity.

use tracing::info;

use crate::api::{ApiGateway, CachedClient};
use crate::cache::RequestCache;
use crate::config::Config;

/// Application session.
///
/// The cache is created once at startup and handed to consumers through
/// [`Session::client`] or [`Session::cache`]. Every identity change clears it
/// so nothing fetched for one user is served to the next.
pub struct Session<G: ApiGateway> {
  client: CachedClient<G>,
  user: Option<String>,
}

impl<G: ApiGateway> Session<G> {
  pub fn new(gateway: G, config: Config) -> Self {
    let cache = RequestCache::new(config.cache.options());
    Self {
      client: CachedClient::new(gateway, cache, config),
      user: None,
    }
  }

  pub fn login(&mut self, user: impl Into<String>) {
    let user = user.into();
    self.client.cache().clear_all_cache();
    info!(user = %user, "Session started");
    self.user = Some(user);
  }

  pub fn logout(&mut self) {
    self.client.cache().clear_all_cache();
    if let Some(user) = self.user.take() {
      info!(user = %user, "Session ended");
    }
  }

  pub fn user(&self) -> Option<&str> {
    self.user.as_deref()
  }

  pub fn client(&self) -> &CachedClient<G> {
    &self.client
  }

  pub fn cache(&self) -> &RequestCache {
    self.client.cache()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Params;
  use color_eyre::Result;
  use serde_json::{json, Value};

  #[derive(Clone)]
  struct StaticGateway;

  impl ApiGateway for StaticGateway {
    async fn fetch(&self, resource: &str, _params: Option<&Params>) -> Result<Value> {
      Ok(json!({ "resource": resource }))
    }
  }

  fn config() -> Config {
    Config::parse("api:\n  base_url: http://localhost\ncache:\n  max_entries: 10\n").unwrap()
  }

  #[tokio::test]
  async fn test_login_clears_previous_user_data() {
    let mut session = Session::new(StaticGateway, config());
    session.login("alice");
    session.client().fetch("employees", None).await.unwrap();
    assert!(session.cache().has("employees", None));

    session.login("bob");

    assert_eq!(session.user(), Some("bob"));
    assert!(session.cache().is_empty());
  }

  #[tokio::test]
  async fn test_logout_clears_and_notifies() {
    let mut session = Session::new(StaticGateway, config());
    session.login("alice");
    session.client().fetch("products", None).await.unwrap();
    let rx = session.cache().subscribe();

    session.logout();

    assert_eq!(session.user(), None);
    assert!(session.cache().is_empty());
    assert!(rx.has_changed().unwrap());
  }

  #[test]
  fn test_cache_uses_configured_options() {
    let session = Session::new(StaticGateway, config());
    assert_eq!(session.cache().options().max_entries.map(|n| n.get()), Some(10));
  }
}
