//! Volunteer matching for an elder's requested appointment.
//!
//! Hard filters (gender, availability window) run first; survivors are ranked
//! by personality similarity computed from provider embeddings, with distance
//! reported alongside and optionally folded in through a configurable weight.

pub mod availability;
pub mod geo;
pub mod ranker;
pub mod similarity;

use chrono::NaiveDateTime;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Elder, GeoPoint, MatchRequest, MatchedVolunteer, Volunteer};
use crate::supabase::{DataError, Query, SupabaseClient, ELDERS, VOLUNTEERS};

pub use ranker::{CandidateRanker, ElderProfile};
pub use similarity::{Embedder, PersonalityScorer};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("elder {0} not found")]
    ElderNotFound(String),
    #[error(transparent)]
    Upstream(#[from] DataError),
}

/// A match request that passed validation.
#[derive(Debug, Clone)]
pub struct MatchQuery {
    pub elder_user_id: String,
    pub location: GeoPoint,
    pub slot: NaiveDateTime,
}

impl MatchQuery {
    pub fn from_request(request: &MatchRequest) -> Result<Self, MatchError> {
        let elder_user_id = request
            .elder_user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| MatchError::InvalidRequest("elder_user_id is required".into()))?;

        let location = request
            .location
            .as_ref()
            .and_then(|loc| Some(GeoPoint::new(loc.lat?, loc.lng?)))
            .filter(GeoPoint::is_finite)
            .ok_or_else(|| {
                MatchError::InvalidRequest("location.lat and location.lng are required".into())
            })?;

        let (date, time) = match (request.date.as_deref(), request.time.as_deref()) {
            (Some(date), Some(time)) => (date, time),
            _ => {
                return Err(MatchError::InvalidRequest(
                    "date (YYYY-MM-DD) and time (HH:MM) are required".into(),
                ))
            }
        };
        let slot = availability::parse_slot(date, time)
            .map_err(|err| MatchError::InvalidRequest(format!("invalid date or time: {err}")))?;

        Ok(Self {
            elder_user_id: elder_user_id.to_string(),
            location,
            slot,
        })
    }
}

#[derive(Clone)]
pub struct MatchService {
    supabase: SupabaseClient,
    ranker: CandidateRanker,
}

impl MatchService {
    pub fn new(supabase: SupabaseClient, ranker: CandidateRanker) -> Self {
        Self { supabase, ranker }
    }

    pub async fn find_volunteers(
        &self,
        request: &MatchRequest,
    ) -> Result<Vec<MatchedVolunteer>, MatchError> {
        let query = MatchQuery::from_request(request)?;

        let elder_row = self
            .supabase
            .select_one(
                &Query::table(ELDERS)
                    .select("gender, preference_tags")
                    .eq("elder_user_id", query.elder_user_id.as_str()),
            )
            .await?
            .ok_or_else(|| MatchError::ElderNotFound(query.elder_user_id.clone()))?;

        let elder: Elder = serde_json::from_value(elder_row).map_err(|err| {
            DataError::Unavailable(format!("failed to decode elder row: {err}"))
        })?;

        let rows = self
            .supabase
            .select(&Query::table(VOLUNTEERS).select(
                "volunteer_user_id, volunteer_name, gender, available_times, location, personality",
            ))
            .await?;
        let volunteers = decode_volunteers(rows);

        let profile = ElderProfile {
            gender: elder.gender,
            location: query.location,
            preference_tags: elder.preference_tags,
        };

        Ok(self.ranker.rank(&profile, query.slot, volunteers).await)
    }
}

/// Rows that fail to decode are dropped individually.
fn decode_volunteers(rows: Vec<Value>) -> Vec<Volunteer> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<Volunteer>(row) {
            Ok(volunteer) => Some(volunteer),
            Err(err) => {
                tracing::warn!(error = %err, "skipping undecodable volunteer row");
                None
            }
        })
        .collect()
}
