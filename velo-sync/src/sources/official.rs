//! Client for the official provider (secondary source)
//!
//! Profile basics straight from the platform: split name, weight in grams,
//! declared ftp. No event listing and no results.

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

pub struct OfficialClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    rate_limit: RateLimitSpec,
}

impl OfficialClient {
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
struct OfficialProfile {
    #[serde(rename = "firstName")]
    first_name: String,
    #[serde(rename = "lastName", default)]
    last_name: Option<String>,
    #[serde(default)]
    ftp: Option<f64>,
    /// Weight in grams, as the platform reports it
    #[serde(default)]
    weight: Option<f64>,
}

impl OfficialProfile {
    fn into_fields(self) -> BTreeMap<String, Value> {
        let name = match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        };
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), json!(name));
        if let Some(ftp) = self.ftp {
            fields.insert("ftp".to_string(), json!(ftp));
        }
        if let Some(grams) = self.weight {
            fields.insert("weight_kg".to_string(), json!(grams / 1000.0));
        }
        fields
    }
}

#[async_trait]
impl SourceClient for OfficialClient {
    fn source(&self) -> SourceId {
        SourceId::Official
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
        debug!(entity = %entity, "official fetch");

        let mut req = self
            .client
            .get(format!("{}/api/profiles/{}", self.base_url, entity.id));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let response = req.send().await.map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(classify_status(response).await);
        }

        let budget = budget_hint_from_headers(response.headers());
        let profile = response
            .json::<OfficialProfile>()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        Ok(FetchResponse {
            payload: profile.into_fields(),
            budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn official_profile_joins_name_and_converts_grams() {
        let profile: OfficialProfile = serde_json::from_value(json!({
            "firstName": "Alex",
            "lastName": "Rivera",
            "ftp": 290.0,
            "weight": 72500.0
        }))
        .unwrap();
        let fields = profile.into_fields();
        assert_eq!(fields["name"], json!("Alex Rivera"));
        assert_eq!(fields["weight_kg"], json!(72.5));
    }
}
