use std::cmp::Ordering;
use std::time::Duration;

use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant};

use crate::matching::availability::is_available;
use crate::matching::geo::distance_between;
use crate::matching::similarity::PersonalityScorer;
use crate::models::{GeoPoint, MatchedVolunteer, Volunteer};

/// The elder side of a match: who they are and where.
#[derive(Debug, Clone)]
pub struct ElderProfile {
    pub gender: Option<String>,
    pub location: GeoPoint,
    pub preference_tags: Vec<String>,
}

struct Scored {
    matched: MatchedVolunteer,
    rank_score: f64,
}

#[derive(Clone)]
pub struct CandidateRanker {
    scorer: PersonalityScorer,
    distance_weight: f64,
    concurrency: usize,
    scoring_deadline: Option<Duration>,
}

impl CandidateRanker {
    pub fn new(scorer: PersonalityScorer, distance_weight: f64, concurrency: usize) -> Self {
        Self {
            scorer,
            distance_weight: if distance_weight.is_finite() {
                distance_weight.max(0.0)
            } else {
                0.0
            },
            concurrency: concurrency.max(1),
            scoring_deadline: None,
        }
    }

    /// Caps the whole scoring pass; embeddings still pending when it expires score 0.
    pub fn with_scoring_deadline(mut self, deadline: Duration) -> Self {
        self.scoring_deadline = Some(deadline);
        self
    }

    /// Filters by gender and availability, then orders survivors by personality score.
    ///
    /// Embedding calls fan out with bounded concurrency; a failed or late call
    /// scores 0 instead of failing the ranking. Ties keep the input order.
    pub async fn rank(
        &self,
        elder: &ElderProfile,
        slot: NaiveDateTime,
        volunteers: Vec<Volunteer>,
    ) -> Vec<MatchedVolunteer> {
        let total = volunteers.len();
        let eligible: Vec<Volunteer> = volunteers
            .into_iter()
            .filter(|v| same_gender(elder.gender.as_deref(), v.gender.as_deref()))
            .filter(|v| is_available(&v.available_times, slot))
            .collect();

        tracing::info!(
            candidates = total,
            eligible = eligible.len(),
            "volunteer hard filters applied"
        );

        if eligible.is_empty() {
            return vec![];
        }

        let deadline = self.scoring_deadline.map(|budget| Instant::now() + budget);
        let elder_embedding = self
            .embed_before(deadline, &elder.preference_tags, "elder")
            .await;
        if elder_embedding.is_none() {
            tracing::warn!("no elder preference embedding; personality scores default to 0");
        }

        let mut scored: Vec<Scored> = stream::iter(eligible)
            .map(|volunteer| {
                let elder_embedding = elder_embedding.as_deref();
                async move {
                    self.score_volunteer(elder, elder_embedding, volunteer, deadline)
                        .await
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        scored.sort_by(|a, b| {
            b.rank_score
                .partial_cmp(&a.rank_score)
                .unwrap_or(Ordering::Equal)
        });

        scored.into_iter().map(|s| s.matched).collect()
    }

    async fn score_volunteer(
        &self,
        elder: &ElderProfile,
        elder_embedding: Option<&[f32]>,
        volunteer: Volunteer,
        deadline: Option<Instant>,
    ) -> Scored {
        let distance = distance_between(Some(elder.location), volunteer.location);

        let personality_score = match elder_embedding {
            Some(elder_vec) => {
                let volunteer_vec = self
                    .embed_before(deadline, &volunteer.personality, &volunteer.volunteer_user_id)
                    .await;
                if volunteer_vec.is_none() {
                    tracing::warn!(
                        volunteer = %volunteer.volunteer_user_id,
                        "no personality embedding for volunteer; scoring 0"
                    );
                }
                PersonalityScorer::score(Some(elder_vec), volunteer_vec.as_deref())
            }
            None => 0.0,
        };

        let rank_score = personality_score + self.proximity_bonus(distance);

        Scored {
            matched: MatchedVolunteer {
                volunteer_user_id: volunteer.volunteer_user_id,
                volunteer_name: volunteer.volunteer_name,
                distance: distance.map(|km| round_to(km, 2)),
                personality_score: round_to(personality_score, 4),
            },
            rank_score,
        }
    }

    async fn embed_before(
        &self,
        deadline: Option<Instant>,
        tags: &[String],
        who: &str,
    ) -> Option<Vec<f32>> {
        let Some(deadline) = deadline else {
            return self.scorer.embed_tags(tags).await;
        };
        match timeout_at(deadline, self.scorer.embed_tags(tags)).await {
            Ok(embedding) => embedding,
            Err(_) => {
                tracing::warn!(who, "scoring deadline reached before embedding finished");
                None
            }
        }
    }

    fn proximity_bonus(&self, distance: Option<f64>) -> f64 {
        if self.distance_weight == 0.0 {
            return 0.0;
        }
        distance
            .map(|km| self.distance_weight / (1.0 + km.max(0.0)))
            .unwrap_or(0.0)
    }
}

/// Both genders must be present and equal after trimming.
fn same_gender(elder: Option<&str>, volunteer: Option<&str>) -> bool {
    match (elder.map(str::trim), volunteer.map(str::trim)) {
        (Some(e), Some(v)) => !e.is_empty() && e == v,
        _ => false,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
