use std::time::Duration;

use serde_json::Value;

use beacon_types::models::{ListingPayload, SearchPayload};

use crate::error::ApiError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(12);
const KEEPALIVE_EXPIRY: Duration = Duration::from_secs(25);
const MAX_IDLE_PER_HOST: usize = 60;

/// Process-wide HTTP client for coordinator → agent calls.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .pool_idle_timeout(KEEPALIVE_EXPIRY)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build()
            .expect("reqwest client builds");
        Self { http }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        base_url: &str,
        url: String,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let response = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|err| ApiError::Upstream(format!("Agent {base_url} unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|payload| {
                    payload
                        .get("detail")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("Agent {base_url} request failed ({status})"));
            return Err(ApiError::Upstream(detail));
        }

        response
            .json()
            .await
            .map_err(|err| ApiError::Upstream(format!("Agent {base_url} sent bad JSON: {err}")))
    }

    pub async fn list_share(
        &self,
        base_url: &str,
        share_id: &str,
        path: &str,
        ticket: &str,
        max_results: usize,
    ) -> Result<ListingPayload, ApiError> {
        let url = format!(
            "{}/agent/v1/shares/{}/list",
            base_url.trim_end_matches('/'),
            share_id
        );
        let max_results = max_results.to_string();
        self.get_json(
            base_url,
            url,
            &[
                ("path", path),
                ("ticket", ticket),
                ("max_results", &max_results),
            ],
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn search_share(
        &self,
        base_url: &str,
        share_id: &str,
        path: &str,
        query: &str,
        recursive: bool,
        ticket: &str,
        max_results: usize,
    ) -> Result<SearchPayload, ApiError> {
        let url = format!(
            "{}/agent/v1/shares/{}/search",
            base_url.trim_end_matches('/'),
            share_id
        );
        let max_results = max_results.to_string();
        self.get_json(
            base_url,
            url,
            &[
                ("path", path),
                ("q", query),
                ("recursive", if recursive { "1" } else { "0" }),
                ("max_results", &max_results),
                ("ticket", ticket),
            ],
        )
        .await
    }
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}
