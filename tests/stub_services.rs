use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use eldercare::supabase::{DataError, Query as RowQuery, SupabaseClient, ELDERS};
use eldercare::{build_router, AppConfig, AppState};

enum Reply {
    Text(&'static str),
    Status(u16),
}

/// In-memory stand-in for the data service, Gemini and LINE.
#[derive(Default)]
struct Stub {
    tables: HashMap<String, Vec<Value>>,
    fail_status: Option<u16>,
    garbled: bool,
    embeddings: HashMap<String, Vec<f32>>,
    stalled_texts: Vec<String>,
    replies: VecDeque<Reply>,
    generate_calls: usize,
    push_status: Option<u16>,
    pushes: Vec<Value>,
}

type Shared = Arc<Mutex<Stub>>;

impl Stub {
    fn seed(&mut self, table: &str, rows: Vec<Value>) {
        self.tables.entry(table.to_string()).or_default().extend(rows);
    }

    fn failure(&self) -> Option<Response> {
        if let Some(status) = self.fail_status {
            let status = StatusCode::from_u16(status).unwrap();
            let body = json!({ "message": format!("stub failure {}", status.as_u16()) });
            return Some((status, Json(body)).into_response());
        }
        if self.garbled {
            return Some((StatusCode::OK, "<html>maintenance</html>").into_response());
        }
        None
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn filters(params: &[(String, String)]) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "select" | "order" | "limit"))
        .filter_map(|(key, value)| Some((key.clone(), value.strip_prefix("eq.")?.to_string())))
        .collect()
}

fn row_matches(row: &Value, filters: &[(String, String)]) -> bool {
    filters
        .iter()
        .all(|(column, value)| row.get(column).and_then(text_of).as_deref() == Some(value))
}

async fn select_rows(
    State(stub): State<Shared>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let stub = stub.lock().unwrap();
    if let Some(failure) = stub.failure() {
        return failure;
    }

    let wanted = filters(&params);
    let mut rows: Vec<Value> = stub
        .tables
        .get(&table)
        .map(|rows| rows.iter().filter(|r| row_matches(r, &wanted)).cloned().collect())
        .unwrap_or_default();

    if let Some((_, order)) = params.iter().find(|(key, _)| key == "order") {
        if let Some((column, direction)) = order.rsplit_once('.') {
            rows.sort_by_key(|row| row.get(column).and_then(text_of).unwrap_or_default());
            if direction == "desc" {
                rows.reverse();
            }
        }
    }
    if let Some((_, limit)) = params.iter().find(|(key, _)| key == "limit") {
        rows.truncate(limit.parse().unwrap());
    }

    Json(Value::Array(rows)).into_response()
}

async fn insert_rows(
    State(stub): State<Shared>,
    Path(table): Path<String>,
    Json(row): Json<Value>,
) -> Response {
    let mut stub = stub.lock().unwrap();
    if let Some(failure) = stub.failure() {
        return failure;
    }
    stub.seed(&table, vec![row.clone()]);
    (StatusCode::CREATED, Json(json!([row]))).into_response()
}

async fn update_rows(
    State(stub): State<Shared>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    Json(patch): Json<Value>,
) -> Response {
    let mut stub = stub.lock().unwrap();
    if let Some(failure) = stub.failure() {
        return failure;
    }

    let wanted = filters(&params);
    let mut updated = vec![];
    for row in stub.tables.entry(table).or_default().iter_mut() {
        if !row_matches(row, &wanted) {
            continue;
        }
        if let (Some(row), Some(patch)) = (row.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                row.insert(key.clone(), value.clone());
            }
        }
        updated.push(row.clone());
    }
    Json(Value::Array(updated)).into_response()
}

async fn delete_rows(
    State(stub): State<Shared>,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let mut stub = stub.lock().unwrap();
    if let Some(failure) = stub.failure() {
        return failure;
    }
    let wanted = filters(&params);
    stub.tables
        .entry(table)
        .or_default()
        .retain(|row| !row_matches(row, &wanted));
    StatusCode::NO_CONTENT.into_response()
}

async fn gemini_call(
    State(stub): State<Shared>,
    Path(call): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if call.ends_with(":embedContent") {
        let text = body
            .pointer("/content/parts/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let (stalled, values) = {
            let stub = stub.lock().unwrap();
            let values = stub.embeddings.get(&text).cloned().unwrap_or(vec![1.0, 0.0]);
            (stub.stalled_texts.contains(&text), values)
        };
        if stalled {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        return Json(json!({ "embedding": { "values": values } })).into_response();
    }

    let mut stub = stub.lock().unwrap();
    stub.generate_calls += 1;
    match stub.replies.pop_front() {
        Some(Reply::Text(text)) => Json(json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        }))
        .into_response(),
        Some(Reply::Status(status)) => (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({ "error": { "message": "model overloaded" } })),
        )
            .into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn line_push(State(stub): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut stub = stub.lock().unwrap();
    if let Some(status) = stub.push_status {
        let status = StatusCode::from_u16(status).unwrap();
        return (status, Json(json!({ "message": "push rejected" }))).into_response();
    }
    stub.pushes.push(body);
    Json(json!({})).into_response()
}

async fn spawn_stub(stub: Shared) -> String {
    let app = Router::new()
        .route(
            "/rest/v1/:table",
            get(select_rows)
                .post(insert_rows)
                .patch(update_rows)
                .delete(delete_rows),
        )
        .route("/v1beta/models/:call", post(gemini_call))
        .route("/v2/bot/message/push", post(line_push))
        .with_state(stub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn stubbed_config(stub: &Shared) -> AppConfig {
    let base = spawn_stub(stub.clone()).await;
    let mut config = AppConfig::for_tests();
    config.supabase.url = base.clone();
    config.gemini.base_url = format!("{base}/v1beta");
    config.line.base_url = base;
    config
}

async fn stubbed_app(stub: &Shared) -> Router {
    let state = AppState::from_config(stubbed_config(stub).await).unwrap();
    build_router(state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn match_body() -> Value {
    json!({
        "elder_user_id": "e1",
        "date": "2025-11-14",
        "time": "09:00",
        "location": { "lat": 25.0340, "lng": 121.5645 }
    })
}

fn seed_match(stub: &mut Stub, volunteers: &[(&str, &str)]) {
    stub.seed(
        ELDERS,
        vec![json!({ "elder_user_id": "e1", "gender": "F", "preference_tags": ["健談"] })],
    );
    let rows = volunteers
        .iter()
        .map(|(id, tag)| {
            json!({
                "volunteer_user_id": id,
                "volunteer_name": format!("name-{id}"),
                "gender": "F",
                "available_times": ["2025-11-14 08:00-12:00"],
                "location": { "lat": 25.0478, "lng": 121.5170 },
                "personality": [tag]
            })
        })
        .collect();
    stub.seed("志工資訊", rows);
}

#[tokio::test]
async fn match_ranks_by_personality_through_the_providers() {
    let stub = Shared::default();
    {
        let mut s = stub.lock().unwrap();
        seed_match(&mut s, &[("A", "安靜"), ("B", "開朗")]);
        s.embeddings.insert("健談".into(), vec![1.0, 0.0]);
        s.embeddings.insert("開朗".into(), vec![0.8, 0.6]);
        s.embeddings.insert("安靜".into(), vec![0.0, 1.0]);
    }
    let app = stubbed_app(&stub).await;

    let (status, body) = send(&app, "POST", "/match", Some(match_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(2));
    assert_eq!(body["volunteers"][0]["volunteer_user_id"], json!("B"));
    assert_eq!(body["volunteers"][0]["personality_score"], json!(0.8));
    assert_eq!(body["volunteers"][1]["personality_score"], json!(0.0));
    assert!(body["volunteers"][0]["distance"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn stalled_embeddings_degrade_to_zero_inside_the_request_timeout() {
    let stub = Shared::default();
    {
        let mut s = stub.lock().unwrap();
        let volunteers: Vec<(String, &str)> =
            (0..10).map(|i| (format!("v{i}"), "開朗")).collect();
        let refs: Vec<(&str, &str)> = volunteers.iter().map(|(id, t)| (id.as_str(), *t)).collect();
        seed_match(&mut s, &refs);
        s.stalled_texts.push("開朗".into());
    }
    let mut config = stubbed_config(&stub).await;
    config.request_timeout_secs = 3;
    config.gemini.timeout_ms = 30_000;
    config.matching.embed_timeout_ms = 800;
    config.matching.embed_retries = 1;
    config.matching.embed_concurrency = 8;
    let app = build_router(AppState::from_config(config).unwrap());

    let started = Instant::now();
    let (status, body) = send(&app, "POST", "/match", Some(match_body())).await;

    assert_eq!(status, StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(body["count"], json!(10));
    let volunteers = body["volunteers"].as_array().unwrap();
    assert!(volunteers.iter().all(|v| v["personality_score"] == json!(0.0)));
}

#[tokio::test]
async fn unknown_elder_is_not_found() {
    let stub = Shared::default();
    let app = stubbed_app(&stub).await;

    let (status, body) = send(&app, "POST", "/match", Some(match_body())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn advice_survives_a_model_outage() {
    let stub = Shared::default();
    {
        let mut s = stub.lock().unwrap();
        s.seed(
            "血壓紀錄",
            vec![
                json!({ "elder_user_id": "e1", "systolic": 135, "diastolic": 88, "recorded_time": "2025-11-14 08:00" }),
                json!({ "elder_user_id": "e1", "systolic": "128", "diastolic": 80, "recorded_time": "2025-11-13 08:00" }),
            ],
        );
        s.replies.push_back(Reply::Status(503));
    }
    let app = stubbed_app(&stub).await;

    let (status, body) = send(&app, "POST", "/advice", Some(json!({ "elder_user_id": "e1" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["advice"], Value::Null);
    assert!(body["error"].as_str().unwrap().contains("model overloaded"));
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][0]["recorded_time"], json!("2025-11-14 08:00"));
}

#[tokio::test]
async fn advice_without_readings_uses_fixed_text() {
    let stub = Shared::default();
    let app = stubbed_app(&stub).await;

    let (status, body) = send(&app, "POST", "/advice", Some(json!({ "elder_user_id": "e1" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["advice"], json!("近 7 天無血壓紀錄"));
    assert_eq!(stub.lock().unwrap().generate_calls, 0);
}

#[tokio::test]
async fn photo_reply_is_repaired_once_then_reported_raw() {
    let stub = Shared::default();
    {
        let mut s = stub.lock().unwrap();
        s.replies.push_back(Reply::Text("hospital: 台大醫院"));
        s.replies.push_back(Reply::Text("still not json"));
    }
    let app = stubbed_app(&stub).await;

    let (status, body) = send(
        &app,
        "POST",
        "/photo-capture",
        Some(json!({ "base64": "iVBORw0KGgo=" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["rawText"], json!("hospital: 台大醫院"));
    assert_eq!(stub.lock().unwrap().generate_calls, 2);
}

#[tokio::test]
async fn photo_reply_fixed_by_repair_round_succeeds() {
    let stub = Shared::default();
    {
        let mut s = stub.lock().unwrap();
        s.replies.push_back(Reply::Text("{hospital_info: null"));
        s.replies.push_back(Reply::Text("```json\n{\"hospital_info\": null}\n```"));
    }
    let app = stubbed_app(&stub).await;

    let (status, body) = send(
        &app,
        "POST",
        "/photo-capture",
        Some(json!({ "base64": "iVBORw0KGgo=" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({ "hospital_info": null }));
}

fn due_schedule(stub: &mut Stub) {
    stub.seed(
        "行事曆",
        vec![json!({
            "uuid": "s1",
            "elder_user_id": "U1",
            "event_id": "Event1",
            "schedule_note": "回診",
            "schedule_time": "2020-01-01 09:00:00",
            "is_reminded": false
        })],
    );
}

fn reminded(stub: &Shared) -> Value {
    stub.lock().unwrap().tables["行事曆"][0]["is_reminded"].clone()
}

#[tokio::test]
async fn failed_push_stays_pending_for_the_next_sweep() {
    let stub = Shared::default();
    {
        let mut s = stub.lock().unwrap();
        due_schedule(&mut s);
        s.push_status = Some(500);
    }
    let app = stubbed_app(&stub).await;

    let (status, body) = send(&app, "GET", "/check-reminders", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "due": 1, "sent": 0, "failed": 1 }));
    assert_eq!(reminded(&stub), json!(false));

    stub.lock().unwrap().push_status = None;
    let (_, body) = send(&app, "GET", "/check-reminders", None).await;
    assert_eq!(body, json!({ "success": true, "due": 1, "sent": 1, "failed": 0 }));
    assert_eq!(reminded(&stub), json!(true));

    let stub = stub.lock().unwrap();
    let pushes = &stub.pushes;
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0]["to"], json!("U1"));
    assert!(pushes[0]["messages"][0]["text"].as_str().unwrap().contains("回診"));
}

#[tokio::test]
async fn overlapping_sweeps_push_once() {
    let stub = Shared::default();
    due_schedule(&mut stub.lock().unwrap());
    let state = AppState::from_config(stubbed_config(&stub).await).unwrap();

    let now = chrono::Utc::now();
    let (first, second) = tokio::join!(
        state.reminders.run_once(now),
        state.reminders.run_once(now)
    );

    assert_eq!(first.unwrap().sent + second.unwrap().sent, 1);
    assert_eq!(stub.lock().unwrap().pushes.len(), 1);
}

#[tokio::test]
async fn data_service_failures_are_classified() {
    let stub = Shared::default();
    let config = stubbed_config(&stub).await;
    let client = SupabaseClient::new(&config.supabase, Duration::from_secs(2)).unwrap();
    let query = RowQuery::table(ELDERS);

    stub.lock().unwrap().fail_status = Some(409);
    match client.select(&query).await {
        Err(DataError::Rejected { status, message }) => {
            assert_eq!(status, 409);
            assert_eq!(message, "stub failure 409");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    stub.lock().unwrap().fail_status = Some(503);
    assert!(matches!(client.select(&query).await, Err(DataError::Unavailable(_))));

    {
        let mut s = stub.lock().unwrap();
        s.fail_status = None;
        s.garbled = true;
    }
    assert!(matches!(client.select(&query).await, Err(DataError::Unavailable(_))));
}

#[tokio::test]
async fn data_service_failures_map_to_status_codes() {
    let stub = Shared::default();
    let app = stubbed_app(&stub).await;

    stub.lock().unwrap().fail_status = Some(400);
    let (status, body) = send(&app, "GET", "/elders", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], json!("stub failure 400"));

    stub.lock().unwrap().fail_status = Some(502);
    let (status, body) = send(&app, "GET", "/elders", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn consultation_lifecycle() {
    let stub = Shared::default();
    stub.lock().unwrap().seed(
        "看診資訊",
        vec![json!({ "elder_user_id": "e1", "event_id": "Event1", "visit_time": "2025-11-01 09:00" })],
    );
    let app = stubbed_app(&stub).await;

    let (status, body) = send(
        &app,
        "POST",
        "/consultations",
        Some(json!({ "elder_user_id": "e1", "visit_time": "2025-11-20 10:00" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["event_id"], json!("Event2"));
    assert!(body["data"]["created_at"].is_string());

    let (status, body) = send(&app, "GET", "/consultations/e1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["event_id"], json!("Event2"));

    let (status, body) = send(
        &app,
        "PATCH",
        "/consultations/e1/Event2",
        Some(json!({ "doctor_name": "陳醫師" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["doctor_name"], json!("陳醫師"));
    assert!(body["data"]["updated_at"].is_string());

    let (status, _) = send(&app, "DELETE", "/consultations/e1/Event2", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, "GET", "/consultations/e1/Event2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/consultations/nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn new_schedule_starts_unreminded() {
    let stub = Shared::default();
    let app = stubbed_app(&stub).await;

    let (status, body) = send(
        &app,
        "POST",
        "/schedules",
        Some(json!({ "elder_user_id": "e1", "schedule_note": "散步", "schedule_time": "2025-11-20 07:00" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["event_id"], json!("Event1"));
    assert_eq!(body["data"]["is_reminded"], json!(false));

    let (status, body) = send(&app, "GET", "/schedules/elder/e1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn keyed_records_and_lookups() {
    let stub = Shared::default();
    {
        let mut s = stub.lock().unwrap();
        s.seed("志工資訊", vec![json!({ "volunteer_user_id": "v1", "volunteer_name": "Lin" })]);
        s.seed(
            "預約志工",
            vec![
                json!({ "GUID": "g1", "V_UserID": "v1", "O_Name": "王奶奶" }),
                json!({ "GUID": "g2", "V_UserID": "v1", "O_Name": "王奶奶" }),
                json!({ "GUID": "g3", "V_UserID": "v1", "O_Name": "李爺爺" }),
                json!({ "GUID": "g4", "V_UserID": "v2", "O_Name": "張奶奶" }),
            ],
        );
    }
    let app = stubbed_app(&stub).await;

    let (status, body) = send(
        &app,
        "POST",
        "/elders",
        Some(json!({ "elder_user_id": "e7", "elder_name": "陳阿嬤" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["elder_user_id"], json!("e7"));

    let (status, body) = send(&app, "GET", "/elders/e7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["elder_name"], json!("陳阿嬤"));

    let (status, _) = send(&app, "PATCH", "/elders/missing", Some(json!({ "elder_name": "x" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, "GET", "/appointments/by-volunteer/v1", None).await;
    assert_eq!(body["data"], json!(["王奶奶", "李爺爺"]));

    let (_, body) = send(&app, "GET", "/identify/v1", None).await;
    assert_eq!(body["role"], json!("volunteer"));
    let (_, body) = send(&app, "GET", "/identify/e7", None).await;
    assert_eq!(body["role"], json!("elder"));
    let (_, body) = send(&app, "GET", "/identify/nobody", None).await;
    assert_eq!(body, json!({ "role": false }));
}
