use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Elder {
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub preference_tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volunteer {
    #[serde(deserialize_with = "string_or_number")]
    pub volunteer_user_id: String,
    #[serde(default)]
    pub volunteer_name: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub available_times: Vec<String>,
    #[serde(default, deserialize_with = "lenient_point")]
    pub location: Option<GeoPoint>,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub personality: Vec<String>,
}

/// Coordinates as sent by clients; either field may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationInput {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchRequest {
    #[serde(default)]
    pub elder_user_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub location: Option<LocationInput>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MatchedVolunteer {
    pub volunteer_user_id: String,
    pub volunteer_name: Option<String>,
    pub distance: Option<f64>,
    pub personality_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResponse {
    pub success: bool,
    pub count: usize,
    pub volunteers: Vec<MatchedVolunteer>,
}

impl MatchResponse {
    pub fn from_matches(volunteers: Vec<MatchedVolunteer>) -> Self {
        Self {
            success: true,
            count: volunteers.len(),
            volunteers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloodPressureRecord {
    #[serde(default)]
    pub elder_user_id: Option<String>,
    #[serde(default)]
    pub elder_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub systolic: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub diastolic: Option<f64>,
    #[serde(default)]
    pub recorded_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdviceRequest {
    #[serde(default)]
    pub elder_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdviceResponse {
    pub success: bool,
    pub data: Vec<BloodPressureRecord>,
    pub advice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoCaptureRequest {
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
}

/// A calendar row as seen by the reminder sweep.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleItem {
    #[serde(deserialize_with = "string_or_number")]
    pub uuid: String,
    #[serde(default)]
    pub elder_user_id: Option<String>,
    #[serde(default)]
    pub schedule_note: Option<String>,
    #[serde(default)]
    pub schedule_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_reminded: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReminderReport {
    pub success: bool,
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Accepts `["a", "b"]`, `"a；b"` or null. Blank entries are dropped.
fn lenient_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(tags_from_value(value.unwrap_or(Value::Null)))
}

pub fn tags_from_value(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(['；', ';', '，', ',', '、'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => vec![],
    }
}

/// A coordinate object that fails to decode is treated as absent.
fn lenient_point<'de, D>(deserializer: D) -> Result<Option<GeoPoint>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(point_from_value))
}

fn point_from_value(value: Value) -> Option<GeoPoint> {
    let lat = value.get("lat").and_then(number_from_value)?;
    let lng = value.get("lng").and_then(number_from_value)?;
    let point = GeoPoint::new(lat, lng);
    point.is_finite().then_some(point)
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_value))
}

fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Some rows store booleans as the strings `"true"` / `"false"`.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
