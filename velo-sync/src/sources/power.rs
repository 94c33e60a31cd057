//! Client for the power provider (secondary source)
//!
//! Carries power-derived rider data only: often fresher ftp and weight than
//! the primary, but no event or results coverage.

use super::{
    budget_hint_from_headers, classify_reqwest_error, classify_status, FetchError, FetchResponse,
    SourceClient,
};
use crate::types::{EntityKind, EntityRef, RateLimitSpec, SourceId};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "velo-sync/0.1 (sync coordination service)";

pub struct PowerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    rate_limit: RateLimitSpec,
}

impl PowerClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        rate_limit: RateLimitSpec,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            rate_limit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PowerProfile {
    name: String,
    #[serde(default)]
    ftp: Option<f64>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(rename = "zpCategory", default)]
    zp_category: Option<String>,
}

impl PowerProfile {
    fn into_fields(self) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), json!(self.name));
        if let Some(ftp) = self.ftp {
            fields.insert("ftp".to_string(), json!(ftp));
        }
        if let Some(weight) = self.weight {
            fields.insert("weight_kg".to_string(), json!(weight));
        }
        if let Some(category) = self.zp_category {
            fields.insert("category".to_string(), json!(category));
        }
        fields
    }
}

#[async_trait]
impl SourceClient for PowerClient {
    fn source(&self) -> SourceId {
        SourceId::Power
    }

    fn rate_limit(&self) -> RateLimitSpec {
        self.rate_limit
    }

    fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Rider
    }

    async fn fetch_entity(&self, entity: &EntityRef) -> Result<FetchResponse, FetchError> {
        if entity.kind != EntityKind::Rider {
            return Err(FetchError::Unsupported("only rider profiles"));
        }
        debug!(entity = %entity, "power fetch");

        let mut req = self
            .client
            .get(format!("{}/profile/{}", self.base_url, entity.id));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let response = req.send().await.map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(classify_status(response).await);
        }

        let budget = budget_hint_from_headers(response.headers());
        let profile = response
            .json::<PowerProfile>()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        Ok(FetchResponse {
            payload: profile.into_fields(),
            budget,
        })
    }
}
