use crate::gemini::GeminiClient;
use crate::models::{AdviceResponse, BloodPressureRecord};
use crate::supabase::{DataError, Query, SupabaseClient, BLOOD_PRESSURE};

pub const ADVICE_HISTORY_LIMIT: usize = 7;
const NO_RECORDS_ADVICE: &str = "近 7 天無血壓紀錄";

/// Short health advice generated from an elder's latest blood-pressure readings.
#[derive(Clone)]
pub struct AdviceService {
    supabase: SupabaseClient,
    gemini: GeminiClient,
}

impl AdviceService {
    pub fn new(supabase: SupabaseClient, gemini: GeminiClient) -> Self {
        Self { supabase, gemini }
    }

    pub async fn advise(&self, elder_user_id: &str) -> Result<AdviceResponse, DataError> {
        let rows = self
            .supabase
            .select(
                &Query::table(BLOOD_PRESSURE)
                    .select("elder_user_id, elder_name, systolic, diastolic, recorded_time")
                    .eq("elder_user_id", elder_user_id)
                    .order("recorded_time", false)
                    .limit(ADVICE_HISTORY_LIMIT),
            )
            .await?;

        let records: Vec<BloodPressureRecord> = rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect();

        if records.is_empty() {
            return Ok(AdviceResponse {
                success: true,
                data: vec![],
                advice: Some(NO_RECORDS_ADVICE.to_string()),
                error: None,
            });
        }

        let prompt = build_advice_prompt(&records);
        let (advice, error) = match self.gemini.generate_text(&prompt).await {
            Ok(text) => (Some(text), None),
            Err(err) => {
                tracing::warn!(elder = %elder_user_id, error = %err, "advice generation failed");
                (None, Some(err.to_string()))
            }
        };

        Ok(AdviceResponse {
            success: true,
            data: records,
            advice,
            error,
        })
    }
}

pub fn build_advice_prompt(records: &[BloodPressureRecord]) -> String {
    let mut prompt =
        String::from("你是一位親切的健康輔助 AI，請針對以下使用者的血壓紀錄提供 50 字左右的健康建議：\n");
    for (idx, record) in records.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. 收縮壓: {}, 舒張壓: {}, 測量時間: {}\n",
            idx + 1,
            format_reading(record.systolic),
            format_reading(record.diastolic),
            record.recorded_time.as_deref().unwrap_or("未知"),
        ));
    }
    prompt
}

fn format_reading(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => format!("{v}"),
        None => "未知".to_string(),
    }
}
