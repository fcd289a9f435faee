//! Generic integration connector client.
//!
//! The platform-specific commerce clients live outside this crate; they
//! present their catalogs through this paged-rows contract. Each page is
//! a set of untyped key-value records the row processor normalizes.

use crate::model::RawRow;
use crate::source::RowSource;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

#[derive(Clone)]
pub struct ConnectorClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for ConnectorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct RowPage {
    pub total: u64,
    pub rows: Vec<RawRow>,
}

impl ConnectorClient {
    pub fn new(base_url: &str, token: String) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid connector base URL")?;
        Ok(Self::with_base_url(token, base_url))
    }

    pub fn with_base_url(token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("catalog-sync/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn build_rows_request(&self, offset: u64, limit: u64) -> Result<reqwest::Request> {
        let mut endpoint = self
            .base_url
            .join("v1/rows")
            .context("invalid connector base URL")?;
        endpoint
            .query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());
        self.http
            .get(endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
            .build()
            .context("failed to build connector request")
    }

    async fn execute_page(&self, offset: u64, limit: u64) -> Result<RowPage> {
        let request = self.build_rows_request(offset, limit)?;
        debug!(url=%request.url(), "fetching connector page");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach connector")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from connector: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("connector error {}: {}", status, body));
        }

        res.json().await.context("invalid connector response")
    }
}

#[async_trait]
impl RowSource for ConnectorClient {
    async fn total(&self) -> Result<u64> {
        let page = self.execute_page(0, 0).await?;
        Ok(page.total)
    }

    async fn fetch(&self, offset: u64, limit: u64) -> Result<Vec<RawRow>> {
        let page = self.execute_page(offset, limit).await?;
        Ok(page.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rows_request_sets_headers_and_query() {
        let client = ConnectorClient::new("https://connector.example.com/", "token".into()).unwrap();
        let request = client.build_rows_request(500, 250).unwrap();

        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/v1/rows");
        let query: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("offset".to_string(), "500".to_string())));
        assert!(query.contains(&("limit".to_string(), "250".to_string())));

        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers.get("Accept").and_then(|h| h.to_str().ok()).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn rejects_malformed_base_url() {
        assert!(ConnectorClient::new("not a url", "t".into()).is_err());
    }

    #[test]
    fn row_page_deserializes() {
        let page: RowPage = serde_json::from_str(
            r#"{"total": 2, "rows": [{"upid": "UP-1", "product_name": "Tee"}, {"upid": "UP-2"}]}"#,
        )
        .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.rows[0].get("product_name").unwrap(), "Tee");
    }
}
