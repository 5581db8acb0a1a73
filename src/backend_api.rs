use crate::opt_env_var;
use crate::service::device::{Device, DeviceState, DEVICE_COLUMNS};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;

// This file talks to the PostgREST endpoint of a Supabase project:
// <https://postgrest.org/en/stable/references/api/tables_views.html>

#[derive(clap::Parser, Debug, Clone)]
pub struct SupabaseArguments {
    /// The base URL of your Supabase project, eg:
    /// `https://abcdefgh.supabase.co`.
    /// If not passed here, it will be read from the SUPABASE_URL
    /// environment variable.
    #[arg(long, global = true)]
    pub supabase_url: Option<String>,

    /// The anon (or service) key for your Supabase project.
    /// If not passed here, it will be read from the SUPABASE_ANON_KEY
    /// environment variable.
    #[arg(long, global = true)]
    pub supabase_key: Option<String>,

    /// The schema that holds the devices table.
    /// You may also set this via the CASA_DEVICES_SCHEMA environment variable.
    #[arg(long, global = true)]
    pub devices_schema: Option<String>,

    /// The name of the devices table.
    /// You may also set this via the CASA_DEVICES_TABLE environment variable.
    #[arg(long, global = true)]
    pub devices_table: Option<String>,
}

impl SupabaseArguments {
    pub fn opt_url(&self) -> anyhow::Result<Option<String>> {
        match &self.supabase_url {
            Some(url) => Ok(Some(url.to_string())),
            None => opt_env_var("SUPABASE_URL"),
        }
    }

    pub fn url(&self) -> anyhow::Result<String> {
        self.opt_url()?.ok_or_else(|| {
            anyhow::anyhow!(
                "Please specify the project url either via the \
                --supabase-url parameter or by setting $SUPABASE_URL"
            )
        })
    }

    pub fn opt_key(&self) -> anyhow::Result<Option<String>> {
        match &self.supabase_key {
            Some(key) => Ok(Some(key.to_string())),
            None => opt_env_var("SUPABASE_ANON_KEY"),
        }
    }

    pub fn key(&self) -> anyhow::Result<String> {
        self.opt_key()?.ok_or_else(|| {
            anyhow::anyhow!(
                "Please specify the api key either via the \
                --supabase-key parameter or by setting $SUPABASE_ANON_KEY"
            )
        })
    }

    pub fn table(&self) -> anyhow::Result<TableRef> {
        let schema = match &self.devices_schema {
            Some(schema) => schema.to_string(),
            None => opt_env_var("CASA_DEVICES_SCHEMA")?.unwrap_or_else(|| "public".to_string()),
        };
        let table = match &self.devices_table {
            Some(table) => table.to_string(),
            None => opt_env_var("CASA_DEVICES_TABLE")?.unwrap_or_else(|| "devices".to_string()),
        };
        Ok(TableRef { schema, table })
    }

    pub fn api_client(&self) -> anyhow::Result<SupabaseClient> {
        Ok(SupabaseClient::new(self.url()?, self.key()?, self.table()?))
    }
}

/// Identifies the table that holds the devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl Default for TableRef {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "devices".to_string(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}", self.schema, self.table)
    }
}

/// The query surface that the dashboard needs from the backend
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Returns every device, ordered ascending by name
    async fn list_devices(&self) -> anyhow::Result<Vec<Device>>;

    /// Sets the state column of the device with the given id
    async fn update_device_state(&self, id: &str, state: DeviceState) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SupabaseClient {
    base_url: String,
    key: String,
    table: TableRef,
    http: reqwest::Client,
}

#[derive(Serialize, Debug)]
struct UpdateStateRequest {
    state: DeviceState,
}

impl SupabaseClient {
    pub fn new<U: Into<String>, K: Into<String>>(base_url: U, key: K, table: TableRef) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            key: key.into(),
            table,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    fn table_endpoint(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table.table)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header("apikey", &self.key)
            .bearer_auth(&self.key);
        if self.table.schema != "public" {
            builder = builder
                .header("Accept-Profile", &self.table.schema)
                .header("Content-Profile", &self.table.schema);
        }
        builder
    }
}

#[async_trait]
impl DeviceBackend for SupabaseClient {
    async fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        let url = self.table_endpoint();
        let response = self
            .request(Method::GET, &url)
            .query(&[("select", DEVICE_COLUMNS), ("order", "name.asc")])
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        http_response_body(response).await
    }

    async fn update_device_state(&self, id: &str, state: DeviceState) -> anyhow::Result<()> {
        let url = self.table_endpoint();
        let filter = format!("eq.{id}");
        let response = self
            .request(Method::PATCH, &url)
            .query(&[("id", filter.as_str())])
            .header("Prefer", "return=minimal")
            .json(&UpdateStateRequest { state })
            .send()
            .await
            .with_context(|| format!("PATCH {url} id={id}"))?;

        check_response_status(response).await
    }
}

pub fn from_json<T: serde::de::DeserializeOwned, S: AsRef<[u8]>>(text: S) -> anyhow::Result<T> {
    let text = text.as_ref();
    serde_json_path_to_error::from_slice(text)
        .map_err(|err| anyhow::anyhow!("{err}. Input: {}", String::from_utf8_lossy(text)))
}

pub async fn json_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> anyhow::Result<T> {
    let url = response.url().clone();
    let data = response
        .bytes()
        .await
        .with_context(|| format!("read {url} response body"))?;
    from_json(&data).with_context(|| format!("parsing {url} response"))
}

/// Fails with the status and response body if the request was
/// not successful
pub async fn check_response_status(response: reqwest::Response) -> anyhow::Result<()> {
    let url = response.url().clone();
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body_bytes = response.bytes().await.with_context(|| {
        format!(
            "request {url} status {}: {}, and failed to read response body",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
    })?;

    anyhow::bail!(
        "request {url} status {}: {}. Response body: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        String::from_utf8_lossy(&body_bytes)
    );
}

pub async fn http_response_body<R: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> anyhow::Result<R> {
    let url = response.url().clone();
    let status = response.status();
    if !status.is_success() {
        check_response_status(response).await?;
        anyhow::bail!("request {url} status {}", status.as_u16());
    }
    json_body(response).await.with_context(|| {
        format!(
            "request {url} status {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorded {
        queries: parking_lot::Mutex<Vec<HashMap<String, String>>>,
        bodies: parking_lot::Mutex<Vec<serde_json::Value>>,
        api_keys: parking_lot::Mutex<Vec<String>>,
    }

    async fn list(
        State(rec): State<Arc<Recorded>>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        rec.queries.lock().push(query);
        if let Some(key) = headers.get("apikey").and_then(|v| v.to_str().ok()) {
            rec.api_keys.lock().push(key.to_string());
        }
        Json(serde_json::json!([
            {"id":"2","name":"Fan","type":"plug","state":"on","ip_address":null,"location_id":"kitchen"},
            {"id":"1","name":"Lamp","type":"light","state":"off","ip_address":"http://lamp.local/api","location_id":null},
        ]))
    }

    async fn update(
        State(rec): State<Arc<Recorded>>,
        Query(query): Query<HashMap<String, String>>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let rejected = query.get("id").map(|id| id == "eq.bad").unwrap_or(false);
        rec.queries.lock().push(query);
        rec.bodies.lock().push(body);
        if rejected {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::NO_CONTENT
        }
    }

    async fn fake_postgrest() -> (SupabaseClient, Arc<Recorded>) {
        let rec = Arc::new(Recorded::default());
        let app = Router::new()
            .route("/rest/v1/devices", get(list).patch(update))
            .with_state(rec.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        let client = SupabaseClient::new(format!("http://{addr}/"), "anon", TableRef::default());
        (client, rec)
    }

    #[tokio::test]
    async fn list_devices_selects_and_orders() {
        let (client, rec) = fake_postgrest().await;
        let devices = client.list_devices().await.unwrap();
        k9::assert_equal!(
            devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["Fan", "Lamp"]
        );
        k9::assert_equal!(devices[0].location_id.as_deref(), Some("kitchen"));

        let query = rec.queries.lock()[0].clone();
        assert_eq!(query["select"], DEVICE_COLUMNS);
        assert_eq!(query["order"], "name.asc");
        k9::assert_equal!(rec.api_keys.lock().clone(), vec!["anon".to_string()]);
    }

    #[tokio::test]
    async fn update_state_filters_by_id() {
        let (client, rec) = fake_postgrest().await;
        client
            .update_device_state("1", DeviceState::On)
            .await
            .unwrap();
        assert_eq!(rec.queries.lock()[0]["id"], "eq.1");
        assert_eq!(rec.bodies.lock()[0], serde_json::json!({"state": "on"}));
    }

    #[tokio::test]
    async fn update_state_rejected() {
        let (client, _rec) = fake_postgrest().await;
        let err = client
            .update_device_state("bad", DeviceState::Off)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("status 400"), "{err:#}");
    }

    #[test]
    fn table_display() {
        k9::assert_equal!(TableRef::default().to_string(), "public.devices");
    }
}
