use super::policy::{classify_status, classify_transport};
use super::{CloudObject, Page, ResourceApi, Scope};
use crate::config::CloudConfig;
use crate::error::{CloudApiError, CloudrowError};
use async_trait::async_trait;
use cloudrow_diff::Record;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("cloudrow/", env!("CARGO_PKG_VERSION"));

/// REST client: `{endpoint}/v1/{region}/{kind}[/{id}]`, JSON bodies, credentials as headers.
pub struct HttpCloud {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpCloud {
    pub fn new(cfg: &CloudConfig) -> Result<Self, CloudrowError> {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .timeout(timeout);

        if let Some(proxy_url) = &cfg.proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str()).map_err(|e| {
                CloudrowError::UnexpectedError(format!("invalid cloud proxy url: {e}"))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            CloudrowError::UnexpectedError(format!("failed to build cloud HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            timeout,
        })
    }

    fn url(&self, scope: &Scope, kind: &str, id: Option<&str>) -> Result<Url, CloudApiError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                CloudApiError::InvalidRequest(format!("endpoint {} cannot be a base", self.endpoint))
            })?;
            segments.pop_if_empty().extend(["v1", scope.api_region(), kind]);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, scope: &Scope) -> RequestBuilder {
        let account = scope.account();
        self.client
            .request(method, url)
            .header("X-Access-Key-Id", account.access_key_id.as_str())
            .header("X-Secret-Access-Key", account.secret_access_key.as_str())
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, CloudApiError> {
        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport(&e, self.timeout))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        debug!(%status, body = %body, "cloud API error response");
        Err(classify_status(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, CloudApiError> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| CloudApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ResourceApi for HttpCloud {
    async fn list(
        &self,
        scope: &Scope,
        kind: &str,
        page_token: Option<String>,
    ) -> Result<Page, CloudApiError> {
        let mut url = self.url(scope, kind, None)?;
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("page_token", &token);
        }
        self.send_json(self.request(Method::GET, url, scope)).await
    }

    async fn get(&self, scope: &Scope, kind: &str, id: &str) -> Result<CloudObject, CloudApiError> {
        let url = self.url(scope, kind, Some(id))?;
        self.send_json(self.request(Method::GET, url, scope)).await
    }

    async fn create(
        &self,
        scope: &Scope,
        kind: &str,
        attributes: Record,
        idempotency_token: &str,
    ) -> Result<CloudObject, CloudApiError> {
        let url = self.url(scope, kind, None)?;
        let req = self
            .request(Method::POST, url, scope)
            .header("Idempotency-Key", idempotency_token)
            .json(&attributes);
        self.send_json(req).await
    }

    async fn update(
        &self,
        scope: &Scope,
        kind: &str,
        id: &str,
        attributes: Record,
    ) -> Result<CloudObject, CloudApiError> {
        let url = self.url(scope, kind, Some(id))?;
        let req = self.request(Method::PATCH, url, scope).json(&attributes);
        self.send_json(req).await
    }

    async fn delete(&self, scope: &Scope, kind: &str, id: &str) -> Result<(), CloudApiError> {
        let url = self.url(scope, kind, Some(id))?;
        self.send(self.request(Method::DELETE, url, scope)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Account;
    use std::sync::Arc;

    fn cloud(endpoint: &str) -> HttpCloud {
        let cfg = CloudConfig {
            endpoint: Url::parse(endpoint).unwrap(),
            ..CloudConfig::default()
        };
        HttpCloud::new(&cfg).unwrap()
    }

    #[test]
    fn builds_resource_urls() {
        let account = Arc::new(Account::new("AK", "SK", "us-east-1", ["us-east-1"]));
        let scope = Scope::regional(account.clone(), "us-east-1");

        let c = cloud("https://cloud.example.com/api/");
        assert_eq!(
            c.url(&scope, "subnet", Some("subnet-1")).unwrap().as_str(),
            "https://cloud.example.com/api/v1/us-east-1/subnet/subnet-1"
        );

        let global = Scope::global(account);
        assert_eq!(
            cloud("http://localhost:4566").url(&global, "dns_zone", None).unwrap().as_str(),
            "http://localhost:4566/v1/global/dns_zone"
        );
    }
}
