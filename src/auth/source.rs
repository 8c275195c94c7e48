//! Token endpoint adapters.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::Config;

/// Body returned by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
  pub access_token: String,
}

/// Something that can hand out a fresh access token.
///
/// `Ok(None)` means the session has no token to give (signed out, rejected);
/// `Err` is a transport or protocol failure.
#[async_trait]
pub trait TokenSource: Send + Sync {
  async fn fetch_token(&self) -> Result<Option<TokenResponse>>;
}

/// Fetches tokens from an HTTP endpoint.
#[derive(Clone)]
pub struct HttpTokenSource {
  http: reqwest::Client,
  url: String,
  session_token: Option<String>,
}

impl HttpTokenSource {
  pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
    Self {
      http,
      url: url.into(),
      session_token: None,
    }
  }

  /// Present `token` as a bearer credential to the token endpoint.
  pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
    self.session_token = Some(token.into());
    self
  }

  /// Build from `api.token_url`, picking up the session credential from the
  /// environment when set.
  pub fn from_config(http: reqwest::Client, config: &Config) -> Result<Self> {
    let url = config
      .api
      .token_url
      .clone()
      .ok_or_else(|| eyre!("api.token_url is required to fetch access tokens"))?;

    let source = Self::new(http, url);
    Ok(match Config::get_session_token() {
      Ok(token) => source.with_session_token(token),
      Err(_) => source,
    })
  }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
  async fn fetch_token(&self) -> Result<Option<TokenResponse>> {
    let mut request = self.http.get(&self.url);
    if let Some(session) = &self.session_token {
      request = request.bearer_auth(session);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach token endpoint: {}", e))?;

    match response.status() {
      StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Ok(None),
      status if !status.is_success() => {
        return Err(eyre!("Token endpoint returned {}", status));
      }
      _ => {}
    }

    // A JSON `null` body means "no token"
    let token: Option<TokenResponse> = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse token response: {}", e))?;

    Ok(token)
  }
}

/// Always hands out the same token. Useful for service accounts and tests.
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
  token: String,
}

impl StaticTokenSource {
  pub fn new(token: impl Into<String>) -> Self {
    Self {
      token: token.into(),
    }
  }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
  async fn fetch_token(&self) -> Result<Option<TokenResponse>> {
    Ok(Some(TokenResponse {
      access_token: self.token.clone(),
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_http_source_returns_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/auth/token"))
      .and(header("authorization", "Bearer session-1"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "abc"})))
      .expect(1)
      .mount(&server)
      .await;

    let source = HttpTokenSource::new(reqwest::Client::new(), format!("{}/auth/token", server.uri()))
      .with_session_token("session-1");

    let token = source.fetch_token().await.unwrap();
    assert_eq!(
      token,
      Some(TokenResponse {
        access_token: "abc".into()
      })
    );
  }

  #[tokio::test]
  async fn test_http_source_rejected_session_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(401))
      .mount(&server)
      .await;

    let source = HttpTokenSource::new(reqwest::Client::new(), server.uri());
    assert_eq!(source.fetch_token().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_http_source_null_body_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::Value::Null))
      .mount(&server)
      .await;

    let source = HttpTokenSource::new(reqwest::Client::new(), server.uri());
    assert_eq!(source.fetch_token().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_http_source_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;

    let source = HttpTokenSource::new(reqwest::Client::new(), server.uri());
    assert!(source.fetch_token().await.is_err());
  }

  #[test]
  fn test_from_config_requires_token_url() {
    let config = Config::new("https://sync.example.com");
    assert!(HttpTokenSource::from_config(reqwest::Client::new(), &config).is_err());
  }
}
