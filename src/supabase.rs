use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::SupabaseConfig;

pub const ELDERS: &str = "長者資訊";
pub const VOLUNTEERS: &str = "志工資訊";
pub const FAMILIES: &str = "famil_information";
pub const APPOINTMENTS: &str = "預約志工";
pub const CONSULTATIONS: &str = "看診資訊";
pub const SCHEDULES: &str = "行事曆";
pub const BLOOD_PRESSURE: &str = "血壓紀錄";

#[derive(Debug, Error)]
pub enum DataError {
    /// The data service refused the request (bad column, constraint violation, ...).
    #[error("data service rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("data service unavailable: {0}")]
    Unavailable(String),
}

impl DataError {
    fn transport(context: &str, err: reqwest::Error) -> Self {
        DataError::Unavailable(format!("{context}: {err}"))
    }
}

/// Equality-filtered read against one table.
#[derive(Debug, Clone)]
pub struct Query {
    table: String,
    columns: String,
    filters: Vec<(String, String)>,
    order: Option<(String, bool)>,
    limit: Option<usize>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: vec![],
            order: None,
            limit: None,
        }
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into().split(',').map(str::trim).collect::<Vec<_>>().join(",");
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some((column.into(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.columns.clone())];
        params.extend(filter_params(&self.filters));
        if let Some((column, ascending)) = &self.order {
            let direction = if *ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{column}.{direction}")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

fn filter_params(filters: &[(String, String)]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|(column, value)| (column.clone(), format!("eq.{value}")))
        .collect()
}

/// Client for the hosted PostgREST endpoint.
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseClient {
    pub fn new(config: &SupabaseConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    pub async fn select(&self, query: &Query) -> Result<Vec<Value>, DataError> {
        let url = self.table_url(&query.table)?;
        let response = self
            .authorized(self.client.get(url))
            .query(&query.params())
            .send()
            .await
            .map_err(|err| DataError::transport("failed to contact data service during select", err))?;

        decode_rows(response).await
    }

    /// First matching row, if any.
    pub async fn select_one(&self, query: &Query) -> Result<Option<Value>, DataError> {
        let query = query.clone().limit(1);
        Ok(self.select(&query).await?.into_iter().next())
    }

    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        table: &str,
        row: &T,
    ) -> Result<Option<Value>, DataError> {
        let url = self.table_url(table)?;
        let response = self
            .authorized(self.client.post(url))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .map_err(|err| DataError::transport("failed to contact data service during insert", err))?;

        Ok(decode_rows(response).await?.into_iter().next())
    }

    pub async fn update<T: Serialize + ?Sized>(
        &self,
        table: &str,
        filters: &[(&str, &str)],
        patch: &T,
    ) -> Result<Vec<Value>, DataError> {
        let url = self.table_url(table)?;
        let response = self
            .authorized(self.client.patch(url))
            .header("Prefer", "return=representation")
            .query(&owned_filters(filters))
            .json(patch)
            .send()
            .await
            .map_err(|err| DataError::transport("failed to contact data service during update", err))?;

        decode_rows(response).await
    }

    pub async fn delete(&self, table: &str, filters: &[(&str, &str)]) -> Result<(), DataError> {
        if filters.is_empty() {
            return Err(DataError::Rejected {
                status: 400,
                message: "refusing to delete without a filter".to_string(),
            });
        }

        let url = self.table_url(table)?;
        let response = self
            .authorized(self.client.delete(url))
            .query(&owned_filters(filters))
            .send()
            .await
            .map_err(|err| DataError::transport("failed to contact data service during delete", err))?;

        check_status(response).await.map(|_| ())
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn table_url(&self, table: &str) -> Result<Url, DataError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| DataError::Unavailable(format!("invalid data service url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| DataError::Unavailable("data service url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["rest", "v1", table]);
        Ok(url)
    }
}

fn owned_filters(filters: &[(&str, &str)]) -> Vec<(String, String)> {
    let owned: Vec<(String, String)> = filters
        .iter()
        .map(|(column, value)| (column.to_string(), value.to_string()))
        .collect();
    filter_params(&owned)
}

async fn check_status(response: Response) -> Result<Response, DataError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = normalize_err_body(&body);
    if status.is_client_error() {
        Err(DataError::Rejected {
            status: status.as_u16(),
            message,
        })
    } else {
        Err(DataError::Unavailable(format!("{status}: {message}")))
    }
}

async fn decode_rows(response: Response) -> Result<Vec<Value>, DataError> {
    let response = check_status(response).await?;
    let text = response
        .text()
        .await
        .map_err(|err| DataError::transport("failed to read data service response", err))?;

    if text.trim().is_empty() {
        return Ok(vec![]);
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Array(rows)) => Ok(rows),
        Ok(Value::Null) => Ok(vec![]),
        Ok(row) => Ok(vec![row]),
        Err(err) => Err(DataError::Unavailable(format!(
            "failed to decode data service response: {err}"
        ))),
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        for key in ["message", "error", "hint"] {
            if let Some(message) = json.get(key).and_then(|v| v.as_str()) {
                return message.to_string();
            }
        }
    }

    trimmed.to_string()
}
