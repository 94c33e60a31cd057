//! Client for the racing provider (primary source)
//!
//! The racing provider carries the most complete rider profiles and is the
//! only source that lists upcoming events and race results.

use super::{
    budget_hint_from_headers, classify_reqwest_error, classify_status, BudgetHint, EventHead,
    FetchError, FetchResponse, SourceClient,
};
use crate::types::{EntityKind, EntityRef, RateLimitSpec, SourceId};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "velo-sync/0.1 (sync coordination service)";

pub struct RacingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    rate_limit: RateLimitSpec,
}

impl RacingClient {
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

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<(T, Option<BudgetHint>), FetchError> {
        let response = self
            .request(path)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            return Err(classify_status(response).await);
        }

        let budget = budget_hint_from_headers(response.headers());
        let body = response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?;
        Ok((body, budget))
    }
}

#[derive(Debug, Deserialize)]
struct RiderProfile {
    name: String,
    #[serde(default)]
    ftp: Option<f64>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    race: Option<RaceRating>,
    #[serde(default)]
    club: Option<ClubRef>,
}

#[derive(Debug, Deserialize)]
struct RaceRating {
    rating: f64,
}

#[derive(Debug, Deserialize)]
struct ClubRef {
    id: u64,
}

impl RiderProfile {
    fn into_fields(self) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), json!(self.name));
        if let Some(ftp) = self.ftp {
            fields.insert("ftp".to_string(), json!(ftp));
        }
        if let Some(weight) = self.weight {
            fields.insert("weight_kg".to_string(), json!(weight));
        }
        if let Some(category) = self.category {
            fields.insert("category".to_string(), json!(category));
        }
        if let Some(race) = self.race {
            fields.insert("racing_score".to_string(), json!(race.rating));
        }
        if let Some(club) = self.club {
            fields.insert("club_id".to_string(), json!(club.id));
        }
        fields
    }
}

#[derive(Debug, Deserialize)]
struct EventDetail {
    id: u64,
    name: String,
    /// Event start as epoch milliseconds
    #[serde(rename = "eventStart")]
    event_start: i64,
    #[serde(default)]
    route: Option<String>,
    #[serde(default)]
    distance_km: Option<f64>,
}

impl EventDetail {
    fn starts_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.event_start)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn into_fields(self) -> BTreeMap<String, Value> {
        let starts_at = self.starts_at();
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), json!(self.name));
        fields.insert("starts_at".to_string(), json!(starts_at.to_rfc3339()));
        if let Some(route) = self.route {
            fields.insert("route".to_string(), json!(route));
        }
        if let Some(distance) = self.distance_km {
            fields.insert("distance_km".to_string(), json!(distance));
        }
        fields
    }
}

#[derive(Debug, Deserialize)]
struct ResultRow {
    rider_id: u64,
    position: u32,
    #[serde(default)]
    time_secs: Option<f64>,
}

#[async_trait]
impl SourceClient for RacingClient {
    fn source(&self) -> SourceId {
        SourceId::Racing
    }

    fn rate_limit(&self) -> RateLimitSpec {
        self.rate_limit
    }

    async fn fetch_entity(&self, entity: &EntityRef) -> Result<FetchResponse, FetchError> {
        debug!(entity = %entity, "racing fetch");
        match entity.kind {
            EntityKind::Rider => {
                let (profile, budget) = self
                    .get_json::<RiderProfile>(&format!("/riders/{}", entity.id))
                    .await?;
                Ok(FetchResponse {
                    payload: profile.into_fields(),
                    budget,
                })
            }
            EntityKind::Event => {
                let (event, budget) = self
                    .get_json::<EventDetail>(&format!("/events/{}", entity.id))
                    .await?;
                Ok(FetchResponse {
                    payload: event.into_fields(),
                    budget,
                })
            }
            EntityKind::RaceResults => {
                let (rows, budget) = self
                    .get_json::<Vec<ResultRow>>(&format!("/events/{}/results", entity.id))
                    .await?;
                let results: Vec<Value> = rows
                    .into_iter()
                    .map(|r| {
                        json!({
                            "rider_id": r.rider_id,
                            "position": r.position,
                            "time_secs": r.time_secs,
                        })
                    })
                    .collect();
                let mut payload = BTreeMap::new();
                payload.insert("event_id".to_string(), json!(entity.id));
                payload.insert("result_count".to_string(), json!(results.len()));
                payload.insert("results".to_string(), Value::Array(results));
                Ok(FetchResponse { payload, budget })
            }
        }
    }

    async fn list_upcoming_events(
        &self,
    ) -> Result<(Vec<EventHead>, Option<BudgetHint>), FetchError> {
        let (events, budget) = self.get_json::<Vec<EventDetail>>("/events/upcoming").await?;
        let heads = events
            .into_iter()
            .map(|e| EventHead {
                id: e.id,
                starts_at: e.starts_at(),
                name: e.name,
            })
            .collect();
        Ok((heads, budget))
    }

    async fn list_club_riders(
        &self,
        club_id: u64,
    ) -> Result<(Vec<u64>, Option<BudgetHint>), FetchError> {
        #[derive(Debug, Deserialize)]
        struct ClubMember {
            rider_id: u64,
        }
        let (members, budget) = self
            .get_json::<Vec<ClubMember>>(&format!("/clubs/{club_id}/riders"))
            .await?;
        Ok((members.into_iter().map(|m| m.rider_id).collect(), budget))
    }
}
