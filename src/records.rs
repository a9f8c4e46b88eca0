//! CRUD pass-through to the hosted tables.
//!
//! Every route answers `{ success: true, data }` on success and goes through
//! [`ApiError`] otherwise.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{FixedOffset, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::server::{json_body, ApiError, AppState};
use crate::supabase::{
    Query, APPOINTMENTS, BLOOD_PRESSURE, CONSULTATIONS, ELDERS, FAMILIES, SCHEDULES, VOLUNTEERS,
};

type ApiResult = Result<Json<Value>, ApiError>;
type Created = Result<(StatusCode, Json<Value>), ApiError>;

/// A table addressed by a single key column.
#[derive(Debug)]
pub struct Resource {
    pub table: &'static str,
    pub key: &'static str,
    pub label: &'static str,
    pub order: Option<(&'static str, bool)>,
    pub stamp_created: bool,
}

/// A per-elder table addressed by `(elder_user_id, event_id)`.
#[derive(Debug)]
pub struct EventResource {
    pub table: &'static str,
    pub label: &'static str,
    pub list_order: (&'static str, bool),
    pub elder_order: (&'static str, bool),
    pub require_rows_for_elder: bool,
    pub track_reminders: bool,
}

pub static ELDER_RECORDS: Resource = Resource {
    table: ELDERS,
    key: "elder_user_id",
    label: "elder",
    order: Some(("created_at", false)),
    stamp_created: false,
};

pub static VOLUNTEER_RECORDS: Resource = Resource {
    table: VOLUNTEERS,
    key: "volunteer_user_id",
    label: "volunteer",
    order: None,
    stamp_created: false,
};

pub static FAMILY_RECORDS: Resource = Resource {
    table: FAMILIES,
    key: "family_user_id",
    label: "family member",
    order: Some(("created_at", false)),
    stamp_created: true,
};

pub static APPOINTMENT_RECORDS: Resource = Resource {
    table: APPOINTMENTS,
    key: "GUID",
    label: "appointment",
    order: Some(("created_at", false)),
    stamp_created: false,
};

pub static CONSULTATION_RECORDS: EventResource = EventResource {
    table: CONSULTATIONS,
    label: "consultation",
    list_order: ("created_at", false),
    elder_order: ("visit_time", false),
    require_rows_for_elder: true,
    track_reminders: false,
};

pub static SCHEDULE_RECORDS: EventResource = EventResource {
    table: SCHEDULES,
    label: "schedule",
    list_order: ("schedule_time", true),
    elder_order: ("schedule_time", true),
    require_rows_for_elder: false,
    track_reminders: true,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/elders", keyed_routes(&ELDER_RECORDS))
        .nest("/volunteers", keyed_routes(&VOLUNTEER_RECORDS))
        .nest("/families", keyed_routes(&FAMILY_RECORDS))
        .nest(
            "/appointments",
            keyed_routes(&APPOINTMENT_RECORDS)
                .route("/by-volunteer/:v_user_id", get(elders_for_volunteer)),
        )
        .nest("/consultations", event_routes(&CONSULTATION_RECORDS, ""))
        .nest("/schedules", event_routes(&SCHEDULE_RECORDS, "/elder"))
        .route("/blood-pressure", axum::routing::post(create_blood_pressure))
        .route("/blood-pressure/:elder_user_id", get(list_blood_pressure))
        .route("/identify/:id", get(identify))
}

fn keyed_routes(resource: &'static Resource) -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(move |State(state): State<AppState>| list_rows(state, resource)).post(
                move |State(state): State<AppState>,
                      payload: Result<Json<Value>, JsonRejection>| {
                    create_row(state, resource, payload)
                },
            ),
        )
        .route(
            "/:key",
            get(
                move |State(state): State<AppState>, Path(key): Path<String>| {
                    get_row(state, resource, key)
                },
            )
            .patch(
                move |State(state): State<AppState>,
                      Path(key): Path<String>,
                      payload: Result<Json<Value>, JsonRejection>| {
                    update_row(state, resource, key, payload)
                },
            )
            .delete(
                move |State(state): State<AppState>, Path(key): Path<String>| {
                    delete_row(state, resource, key)
                },
            ),
        )
}

fn event_routes(resource: &'static EventResource, elder_prefix: &str) -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(move |State(state): State<AppState>| list_events(state, resource)).post(
                move |State(state): State<AppState>,
                      payload: Result<Json<Value>, JsonRejection>| {
                    create_event(state, resource, payload)
                },
            ),
        )
        .route(
            &format!("{elder_prefix}/:elder_user_id"),
            get(
                move |State(state): State<AppState>, Path(elder): Path<String>| {
                    list_elder_events(state, resource, elder)
                },
            ),
        )
        .route(
            &format!("{elder_prefix}/:elder_user_id/:event_id"),
            get(
                move |State(state): State<AppState>,
                      Path((elder, event)): Path<(String, String)>| {
                    get_event(state, resource, elder, event)
                },
            )
            .patch(
                move |State(state): State<AppState>,
                      Path((elder, event)): Path<(String, String)>,
                      payload: Result<Json<Value>, JsonRejection>| {
                    update_event(state, resource, elder, event, payload)
                },
            )
            .delete(
                move |State(state): State<AppState>,
                      Path((elder, event)): Path<(String, String)>| {
                    delete_event(state, resource, elder, event)
                },
            ),
        )
}

async fn list_rows(state: AppState, resource: &'static Resource) -> ApiResult {
    let mut query = Query::table(resource.table);
    if let Some((column, ascending)) = resource.order {
        query = query.order(column, ascending);
    }
    let rows = state.supabase.select(&query).await?;
    Ok(success(Value::Array(rows)))
}

async fn get_row(state: AppState, resource: &'static Resource, key: String) -> ApiResult {
    let row = state
        .supabase
        .select_one(&Query::table(resource.table).eq(resource.key, key.as_str()))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("{} {key} not found", resource.label)))?;
    Ok(success(row))
}

async fn create_row(
    state: AppState,
    resource: &'static Resource,
    payload: Result<Json<Value>, JsonRejection>,
) -> Created {
    let mut row = object_body(payload)?;
    if resource.stamp_created {
        row.insert(
            "created_at".to_string(),
            json!(now_stamp(state.config.local_offset())),
        );
        row.insert("updated_at".to_string(), Value::Null);
    }

    let data = state.supabase.insert(resource.table, &row).await?;
    tracing::info!(table = resource.table, "row created");
    Ok((StatusCode::CREATED, success(data.unwrap_or(Value::Null))))
}

async fn update_row(
    state: AppState,
    resource: &'static Resource,
    key: String,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let patch = stamped_patch(payload, state.config.local_offset())?;
    let mut rows = state
        .supabase
        .update(resource.table, &[(resource.key, key.as_str())], &patch)
        .await?;
    if rows.is_empty() {
        return Err(ApiError::not_found(format!("{} {key} not found", resource.label)));
    }
    Ok(success(rows.swap_remove(0)))
}

async fn delete_row(state: AppState, resource: &'static Resource, key: String) -> ApiResult {
    state
        .supabase
        .delete(resource.table, &[(resource.key, key.as_str())])
        .await?;
    Ok(deleted(resource.label))
}

async fn elders_for_volunteer(
    State(state): State<AppState>,
    Path(v_user_id): Path<String>,
) -> ApiResult {
    let rows = state
        .supabase
        .select(
            &Query::table(APPOINTMENTS)
                .select("O_Name")
                .eq("V_UserID", v_user_id.as_str()),
        )
        .await?;

    let mut names: Vec<String> = Vec::new();
    for name in rows
        .iter()
        .filter_map(|row| row.get("O_Name").and_then(Value::as_str))
    {
        if !names.iter().any(|seen| seen == name) {
            names.push(name.to_string());
        }
    }

    Ok(success(json!(names)))
}

async fn list_events(state: AppState, resource: &'static EventResource) -> ApiResult {
    let (column, ascending) = resource.list_order;
    let rows = state
        .supabase
        .select(&Query::table(resource.table).order(column, ascending))
        .await?;
    Ok(success(Value::Array(rows)))
}

async fn list_elder_events(
    state: AppState,
    resource: &'static EventResource,
    elder_user_id: String,
) -> ApiResult {
    let (column, ascending) = resource.elder_order;
    let rows = state
        .supabase
        .select(
            &Query::table(resource.table)
                .eq("elder_user_id", elder_user_id.as_str())
                .order(column, ascending),
        )
        .await?;

    if rows.is_empty() && resource.require_rows_for_elder {
        return Err(ApiError::not_found(format!(
            "no {} records for elder {elder_user_id}",
            resource.label
        )));
    }
    Ok(success(Value::Array(rows)))
}

async fn get_event(
    state: AppState,
    resource: &'static EventResource,
    elder_user_id: String,
    event_id: String,
) -> ApiResult {
    let row = state
        .supabase
        .select_one(
            &Query::table(resource.table)
                .eq("elder_user_id", elder_user_id.as_str())
                .eq("event_id", event_id.as_str()),
        )
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!(
                "{} {event_id} not found for elder {elder_user_id}",
                resource.label
            ))
        })?;
    Ok(success(row))
}

async fn create_event(
    state: AppState,
    resource: &'static EventResource,
    payload: Result<Json<Value>, JsonRejection>,
) -> Created {
    let mut row = object_body(payload)?;
    let elder_user_id = row
        .get("elder_user_id")
        .and_then(id_text)
        .ok_or_else(|| ApiError::bad_request("elder_user_id is required"))?;

    let existing = state
        .supabase
        .select(
            &Query::table(resource.table)
                .select("event_id")
                .eq("elder_user_id", elder_user_id.as_str()),
        )
        .await?;
    let event_id = next_event_id(
        existing
            .iter()
            .filter_map(|r| r.get("event_id").and_then(Value::as_str)),
    );

    row.insert("event_id".to_string(), json!(event_id));
    row.insert(
        "created_at".to_string(),
        json!(now_stamp(state.config.local_offset())),
    );
    row.insert("updated_at".to_string(), Value::Null);
    if resource.track_reminders {
        row.insert("is_reminded".to_string(), json!(false));
    }

    let data = state.supabase.insert(resource.table, &row).await?;
    tracing::info!(table = resource.table, elder = %elder_user_id, event = %event_id, "event created");
    Ok((StatusCode::CREATED, success(data.unwrap_or(Value::Null))))
}

async fn update_event(
    state: AppState,
    resource: &'static EventResource,
    elder_user_id: String,
    event_id: String,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let patch = stamped_patch(payload, state.config.local_offset())?;
    let mut rows = state
        .supabase
        .update(
            resource.table,
            &[
                ("elder_user_id", elder_user_id.as_str()),
                ("event_id", event_id.as_str()),
            ],
            &patch,
        )
        .await?;
    if rows.is_empty() {
        return Err(ApiError::not_found(format!(
            "{} {event_id} not found for elder {elder_user_id}",
            resource.label
        )));
    }
    Ok(success(rows.swap_remove(0)))
}

async fn delete_event(
    state: AppState,
    resource: &'static EventResource,
    elder_user_id: String,
    event_id: String,
) -> ApiResult {
    state
        .supabase
        .delete(
            resource.table,
            &[
                ("elder_user_id", elder_user_id.as_str()),
                ("event_id", event_id.as_str()),
            ],
        )
        .await?;
    Ok(deleted(resource.label))
}

async fn list_blood_pressure(
    State(state): State<AppState>,
    Path(elder_user_id): Path<String>,
) -> ApiResult {
    let rows = state
        .supabase
        .select(
            &Query::table(BLOOD_PRESSURE)
                .eq("elder_user_id", elder_user_id.as_str())
                .order("recorded_time", false),
        )
        .await?;
    Ok(success(Value::Array(rows)))
}

async fn create_blood_pressure(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Created {
    let row = object_body(payload)?;
    for field in ["elder_user_id", "systolic", "diastolic"] {
        if row.get(field).map_or(true, Value::is_null) {
            return Err(ApiError::bad_request(format!("{field} is required")));
        }
    }

    let data = state.supabase.insert(BLOOD_PRESSURE, &row).await?;
    Ok((StatusCode::CREATED, success(data.unwrap_or(Value::Null))))
}

/// Volunteers are checked first, then elders.
async fn identify(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let volunteer = state
        .supabase
        .select_one(&Query::table(VOLUNTEERS).eq("volunteer_user_id", id.as_str()))
        .await?;
    if let Some(data) = volunteer {
        return Ok(Json(json!({ "role": "volunteer", "data": data })));
    }

    let elder = state
        .supabase
        .select_one(&Query::table(ELDERS).eq("elder_user_id", id.as_str()))
        .await?;
    if let Some(data) = elder {
        return Ok(Json(json!({ "role": "elder", "data": data })));
    }

    Ok(Json(json!({ "role": false })))
}

fn success(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

fn deleted(label: &str) -> Json<Value> {
    Json(json!({ "success": true, "message": format!("{label} deleted") }))
}

fn object_body(payload: Result<Json<Value>, JsonRejection>) -> Result<Map<String, Value>, ApiError> {
    match json_body(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::bad_request("request body must be a JSON object")),
    }
}

fn stamped_patch(
    payload: Result<Json<Value>, JsonRejection>,
    offset: FixedOffset,
) -> Result<Map<String, Value>, ApiError> {
    let mut patch = object_body(payload)?;
    if patch.is_empty() {
        return Err(ApiError::bad_request("nothing to update"));
    }
    patch.insert("updated_at".to_string(), json!(now_stamp(offset)));
    Ok(patch)
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn now_stamp(offset: FixedOffset) -> String {
    Utc::now().with_timezone(&offset).to_rfc3339()
}

/// `EventN` one past the highest existing suffix; ids without a numeric suffix are ignored.
pub fn next_event_id<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let highest = Regex::new(r"^Event(\d+)$")
        .ok()
        .and_then(|re| {
            existing
                .into_iter()
                .filter_map(|id| re.captures(id.trim()))
                .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
                .max()
        })
        .unwrap_or(0);
    format!("Event{}", highest.saturating_add(1))
}
