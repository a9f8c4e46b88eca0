use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

#[derive(Clone, Debug)]
pub struct SupabaseConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key: String,
    pub text_model: String,
    pub embedding_model: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct LineConfig {
    pub base_url: String,
    pub channel_access_token: String,
}

/// Knobs for the volunteer ranking pass.
#[derive(Clone, Debug)]
pub struct MatchingConfig {
    /// Weight of the proximity bonus. Zero keeps the order purely by personality score.
    pub distance_weight: f64,
    pub embed_timeout_ms: u64,
    pub embed_retries: u32,
    pub embed_concurrency: usize,
    /// Upper bound for the whole scoring pass of one match request. Zero derives it
    /// from the request timeout.
    pub scoring_budget_ms: u64,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub supabase: SupabaseConfig,
    pub gemini: GeminiConfig,
    pub line: LineConfig,
    pub matching: MatchingConfig,
    pub reminder_poll_secs: u64,
    pub utc_offset_hours: i32,
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("ELDERCARE_BIND").unwrap_or_else(|_| "0.0.0.0:3001".to_string()),
            supabase: SupabaseConfig {
                url: env::var("SUPABASE_URL").unwrap_or_default(),
                api_key: env::var("SUPABASE_API_KEY").unwrap_or_default(),
            },
            gemini: GeminiConfig {
                base_url: env::var("GEMINI_BASE_URL").unwrap_or_else(|_| {
                    "https://generativelanguage.googleapis.com/v1beta".to_string()
                }),
                api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
                text_model: env::var("GEMINI_TEXT_MODEL")
                    .unwrap_or_else(|_| "gemini-1.5-flash".to_string()),
                embedding_model: env::var("GEMINI_EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-004".to_string()),
                timeout_ms: parse_env("GEMINI_TIMEOUT_MS", 30_000),
            },
            line: LineConfig {
                base_url: env::var("LINE_BASE_URL")
                    .unwrap_or_else(|_| "https://api.line.me".to_string()),
                channel_access_token: env::var("LINE_CHANNEL_ACCESS_TOKEN").unwrap_or_default(),
            },
            matching: MatchingConfig {
                distance_weight: parse_env("MATCH_DISTANCE_WEIGHT", 0.0),
                embed_timeout_ms: parse_env("EMBED_TIMEOUT_MS", 8_000),
                embed_retries: parse_env("EMBED_RETRIES", 1),
                embed_concurrency: parse_env("EMBED_CONCURRENCY", 8),
                scoring_budget_ms: parse_env("MATCH_SCORING_BUDGET_MS", 0),
            },
            reminder_poll_secs: parse_env("REMINDER_POLL_SECS", 0),
            utc_offset_hours: parse_env("LOCAL_UTC_OFFSET_HOURS", 8),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|raw| split_origins(&raw))
                .unwrap_or_default(),
            request_timeout_secs: parse_env("REQUEST_TIMEOUT_SECS", 30),
        }
    }

    /// Offline configuration: every collaborator points at a closed local port.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            supabase: SupabaseConfig {
                url: "http://127.0.0.1:9".to_string(),
                api_key: "test-key".to_string(),
            },
            gemini: GeminiConfig {
                base_url: "http://127.0.0.1:9/v1beta".to_string(),
                api_key: "test-key".to_string(),
                text_model: "gemini-1.5-flash".to_string(),
                embedding_model: "text-embedding-004".to_string(),
                timeout_ms: 500,
            },
            line: LineConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                channel_access_token: "test-token".to_string(),
            },
            matching: MatchingConfig {
                distance_weight: 0.0,
                embed_timeout_ms: 500,
                embed_retries: 0,
                embed_concurrency: 4,
                scoring_budget_ms: 0,
            },
            reminder_poll_secs: 0,
            utc_offset_hours: 8,
            cors_origins: vec![],
            request_timeout_secs: 5,
        }
    }

    /// Local wall-clock offset used for stored timestamps and naive schedule times.
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours.clamp(-23, 23) * 3600)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Scoring must finish inside the request timeout with room left for the data
    /// fetches, so it never exceeds three quarters of it.
    pub fn scoring_deadline(&self) -> Duration {
        let ceiling = self.request_timeout() * 3 / 4;
        match self.matching.scoring_budget_ms {
            0 => ceiling,
            budget => Duration::from_millis(budget).min(ceiling),
        }
    }

    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.supabase.url.trim().is_empty() {
            missing.push("SUPABASE_URL");
        }
        if self.supabase.api_key.trim().is_empty() {
            missing.push("SUPABASE_API_KEY");
        }
        if self.gemini.api_key.trim().is_empty() {
            missing.push("GEMINI_API_KEY");
        }
        if self.line.channel_access_token.trim().is_empty() {
            missing.push("LINE_CHANNEL_ACCESS_TOKEN");
        }
        missing
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}
