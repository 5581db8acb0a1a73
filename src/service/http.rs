use crate::cache::DeviceListState;
use crate::service::card::{cards_for, escape_html, DeviceCard};
use crate::service::dashboard::DashboardHandle;
use crate::service::device::DeviceState;
use crate::service::notify::Notification;
use crate::service::toggle::ToggleOutcome;
use crate::webhook::WebhookOutcome;
use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

fn response_with_code<T: ToString + std::fmt::Display>(code: StatusCode, err: T) -> Response {
    if !code.is_success() {
        log::error!("err: {err:#}");
    }

    let mut response = Json(serde_json::json!({
        "code": code.as_u16(),
        "msg": format!("{err:#}")
    }))
    .into_response();
    *response.status_mut() = code;
    response
}

fn not_found<T: ToString + std::fmt::Display>(err: T) -> Response {
    response_with_code(StatusCode::NOT_FOUND, err)
}

#[derive(Serialize)]
struct DeviceListResponse {
    loading: bool,
    error: Option<String>,
    stale: bool,
    live: bool,
    devices: Vec<DeviceCard>,
}

/// Returns the load state of the dashboard along with a card
/// for each device
async fn list_devices(State(dashboard): State<DashboardHandle>) -> Json<DeviceListResponse> {
    let state = dashboard.state();
    Json(DeviceListResponse {
        loading: state.is_loading(),
        error: state.error.clone(),
        stale: state.stale,
        live: dashboard.is_live(),
        devices: cards_for(&state),
    })
}

#[derive(Serialize)]
struct ToggleResponse {
    code: u16,
    persisted: bool,
    webhook: Option<WebhookOutcome>,
}

fn toggle_response(outcome: ToggleOutcome) -> Response {
    let (code, persisted, webhook) = match outcome {
        ToggleOutcome::RolledBack => (StatusCode::BAD_GATEWAY, false, None),
        ToggleOutcome::Persisted(webhook) => (StatusCode::OK, true, Some(webhook)),
    };
    let mut response = Json(ToggleResponse {
        code: code.as_u16(),
        persisted,
        webhook,
    })
    .into_response();
    *response.status_mut() = code;
    response
}

async fn set_device_state(
    dashboard: &DashboardHandle,
    id: &str,
    state: Option<DeviceState>,
) -> Result<Response, Response> {
    let outcome = dashboard
        .toggle_device(id, state)
        .await
        .map_err(not_found)?;
    Ok(toggle_response(outcome))
}

/// Flips the state of a given device
async fn device_toggle(
    State(dashboard): State<DashboardHandle>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    set_device_state(&dashboard, &id, None).await
}

/// Turns on a given device
async fn device_on(
    State(dashboard): State<DashboardHandle>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    set_device_state(&dashboard, &id, Some(DeviceState::On)).await
}

/// Turns off a given device
async fn device_off(
    State(dashboard): State<DashboardHandle>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    set_device_state(&dashboard, &id, Some(DeviceState::Off)).await
}

/// Form target for the switches on the index page
async fn device_toggle_form(
    State(dashboard): State<DashboardHandle>,
    Path(id): Path<String>,
) -> Result<Redirect, Response> {
    dashboard
        .toggle_device(&id, None)
        .await
        .map_err(not_found)?;
    Ok(Redirect::to("/"))
}

async fn list_notifications(State(dashboard): State<DashboardHandle>) -> Json<Vec<Notification>> {
    Json(dashboard.notifier().recent())
}

fn render_index(state: &DeviceListState, notifications: &[Notification]) -> String {
    let mut body = String::new();

    if state.is_loading() {
        body.push_str(r#"<div class="grid">"#);
        for _ in 0..6 {
            body.push_str(r#"<div class="card skeleton"></div>"#);
        }
        body.push_str("</div>");
    }

    if state.is_error() {
        body.push_str(r#"<div class="error">Failed to load devices.</div>"#);
    }

    match &state.devices {
        Some(devices) if devices.is_empty() => {
            body.push_str(
                r#"<div class="card empty"><p>No devices found. Add devices in Supabase to get started.</p></div>"#,
            );
        }
        Some(devices) => {
            body.push_str(r#"<div class="grid">"#);
            for device in devices.iter() {
                body.push_str(&DeviceCard::for_device(device).render_html());
            }
            body.push_str("</div>");
        }
        None => {}
    }

    let mut toasts = String::new();
    for n in notifications.iter().rev() {
        toasts.push_str(&format!(
            r#"<li class="toast {kind}"><strong>{title}</strong>{desc}</li>"#,
            kind = n.kind,
            title = escape_html(&n.title),
            desc = n
                .description
                .as_ref()
                .map(|d| format!("<p>{}</p>", escape_html(d)))
                .unwrap_or_default(),
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="5">
<title>Casa Control Sync</title>
</head>
<body>
<header>
  <h1>Casa Control Sync</h1>
  <p>Real-time home automation dashboard. Manage devices, monitor states, and react instantly.</p>
</header>
<main>
<section aria-labelledby="devices-heading">
<h2 id="devices-heading">Devices</h2>
{body}
</section>
<ul class="toasts">{toasts}</ul>
</main>
</body>
</html>
"#
    )
}

async fn index(State(dashboard): State<DashboardHandle>) -> Html<String> {
    Html(render_index(
        &dashboard.state(),
        &dashboard.notifier().recent(),
    ))
}

fn build_router(dashboard: DashboardHandle) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/device/{id}/toggle", post(device_toggle))
        .route("/api/device/{id}/on", post(device_on))
        .route("/api/device/{id}/off", post(device_off))
        .route("/api/notifications", get(list_notifications))
        .route("/device/{id}/toggle", post(device_toggle_form))
        .route("/", get(index))
        .with_state(dashboard)
}

pub async fn run_http_server(dashboard: DashboardHandle, port: u16) -> anyhow::Result<()> {
    let app = build_router(dashboard);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("run_http_server: binding to port {port}"))?;
    let addr = listener.local_addr()?;
    log::info!("http server addr is {addr:?}");
    if let Err(err) = axum::serve(listener, app).await {
        log::error!("http server stopped: {err:#}");
    }

    Ok(())
}
