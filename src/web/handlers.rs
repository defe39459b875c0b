//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, IntegrationConfig};
use crate::entity::{build_devices, build_sensors, DeviceView, OverallState, SensorView};
use crate::flow::{self, AddDeviceRequest, AlertUpdate, FlowError, SettingsUpdate};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ============================================================================
// Templates (simple string replacement)
// ============================================================================

const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");
const STATUS_TEMPLATE: &str = include_str!("templates/status.html");
const DEVICE_TEMPLATE: &str = include_str!("templates/device.html");

const DEFAULT_HISTORY_LIMIT: u32 = 100;
const MAX_HISTORY_LIMIT: u32 = 1000;

// ============================================================================
// Errors
// ============================================================================

fn flow_error(e: FlowError) -> Response {
    let status = match e {
        FlowError::UnknownDevice(_) | FlowError::UnknownSensor(_) | FlowError::NotConfigured => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": e.code(), "message": e.to_string() }))).into_response()
}

fn db_error(e: DbError) -> Response {
    tracing::error!("Database error: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// Save `config` and make the coordinator follow it.
async fn persist(state: &AppState, config: &IntegrationConfig) -> Result<(), Response> {
    state.store.save_config(config).map_err(db_error)?;
    state.coordinator.apply(config).await;
    Ok(())
}

fn load_config(state: &AppState) -> Result<IntegrationConfig, Response> {
    match state.store.load_config() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Err(flow_error(FlowError::NotConfigured)),
        Err(e) => Err(db_error(e)),
    }
}

/// The stored config, or an empty one before setup.
fn config_or_default(state: &AppState) -> Result<IntegrationConfig, Response> {
    state
        .store
        .load_config()
        .map(Option::unwrap_or_default)
        .map_err(db_error)
}

// ============================================================================
// Status page
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> Response {
    let config = match config_or_default(&state) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let snapshot = state.coordinator.snapshot().await;
    let devices = build_devices(&config, &snapshot);

    let devices_html = if devices.is_empty() {
        "<p>No devices configured. Add one with <code>POST /api/devices</code>.</p>".to_string()
    } else {
        devices.iter().map(render_device).collect::<Vec<_>>().join("\n")
    };

    let content = STATUS_TEMPLATE
        .replace("{{dns_server}}", &config.dns_server.to_string())
        .replace("{{interval}}", &config.poll_interval_secs.to_string())
        .replace("{{device_count}}", &devices.len().to_string())
        .replace("{{sensor_count}}", &config.targets.len().to_string())
        .replace("{{devices}}", &devices_html);

    let page = LAYOUT_TEMPLATE
        .replace("{{title}}", "Connectivity Monitor")
        .replace("{{content}}", &content);

    Html(page).into_response()
}

fn render_device(device: &DeviceView) -> String {
    let rows = device
        .sensors
        .iter()
        .map(render_sensor_row)
        .collect::<Vec<_>>()
        .join("\n");

    let overall = match device.overall.state {
        OverallState::Connected => "Connected",
        OverallState::PartiallyConnected => "Partially Connected",
        OverallState::Disconnected => "Disconnected",
        OverallState::NotConnected => "Not Connected",
    };

    // Fixed fields first; user-supplied text goes in last
    DEVICE_TEMPLATE
        .replace(
            "{{alerting}}",
            if device.alerting { "<span class=\"alerting\">ALERT</span>" } else { "" },
        )
        .replace("{{overall_class}}", &state_class(overall))
        .replace("{{overall}}", overall)
        .replace("{{connected}}", &device.overall.connected.to_string())
        .replace("{{total}}", &device.overall.total.to_string())
        .replace("{{alert_delay}}", &device.alert_delay.to_string())
        .replace("{{mac}}", &escape_html(device.info.mac_address.as_deref().unwrap_or("unknown")))
        .replace(
            "{{alert_group}}",
            &escape_html(device.alert_group.as_deref().unwrap_or("log only")),
        )
        .replace("{{host}}", &escape_html(&device.host))
        .replace("{{rows}}", &rows)
        .replace("{{name}}", &escape_html(&device.info.name))
}

fn render_sensor_row(sensor: &SensorView) -> String {
    let attrs = &sensor.attributes;
    let state = sensor.state.to_string();

    format!(
        "        <tr><td>{}</td><td class=\"{}\">{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
        escape_html(&sensor.name),
        state_class(&state),
        state,
        attrs
            .latency_ms
            .map(|ms| format!("{:.2} ms", ms))
            .unwrap_or_else(|| "-".to_string()),
        attrs.resolved_ip.as_deref().unwrap_or("-"),
        attrs.failure.map(|f| f.as_str()).unwrap_or("-"),
        attrs
            .last_update
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string()),
    )
}

fn state_class(state: &str) -> String {
    format!("state-{}", state.to_ascii_lowercase().replace(' ', "-"))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('{', "&#123;")
        .replace('}', "&#125;")
}

// ============================================================================
// API: Settings
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub dns_server: String,
    pub interval: u64,
    pub devices: usize,
    pub sensors: usize,
}

pub async fn handle_get_settings(State(state): State<AppState>) -> Response {
    match load_config(&state) {
        Ok(config) => Json(settings_response(&config)).into_response(),
        Err(resp) => resp,
    }
}

fn settings_response(config: &IntegrationConfig) -> SettingsResponse {
    SettingsResponse {
        dns_server: config.dns_server.to_string(),
        interval: config.poll_interval_secs,
        devices: config.hosts().len(),
        sensors: config.targets.len(),
    }
}

pub async fn handle_update_settings(
    State(state): State<AppState>,
    Json(req): Json<SettingsUpdate>,
) -> Response {
    let _guard = state.config_lock.lock().await;

    let mut config = match load_config(&state) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = flow::update_settings(&mut config, &req) {
        return flow_error(e);
    }
    if let Err(resp) = persist(&state, &config).await {
        return resp;
    }

    tracing::info!(
        "Settings updated: interval {}s, DNS server {}",
        config.poll_interval_secs,
        config.dns_server
    );
    Json(settings_response(&config)).into_response()
}

// ============================================================================
// API: Devices
// ============================================================================

pub async fn handle_get_devices(State(state): State<AppState>) -> Response {
    let config = match config_or_default(&state) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let snapshot = state.coordinator.snapshot().await;
    Json(build_devices(&config, &snapshot)).into_response()
}

pub async fn handle_add_device(
    State(state): State<AppState>,
    Json(req): Json<AddDeviceRequest>,
) -> Response {
    let _guard = state.config_lock.lock().await;

    let current = match state.store.load_config() {
        Ok(c) => c,
        Err(e) => return db_error(e),
    };
    let config = match flow::add_device(current.as_ref(), &req, &state.notifier.group_names()) {
        Ok(c) => c,
        Err(e) => return flow_error(e),
    };
    if let Err(resp) = persist(&state, &config).await {
        return resp;
    }

    let host = req.host.trim();
    tracing::info!("Added device {} ({:?})", host, req.protocol);

    let snapshot = state.coordinator.snapshot().await;
    let device = build_devices(&config, &snapshot)
        .into_iter()
        .find(|d| d.host == host);
    (StatusCode::CREATED, Json(device)).into_response()
}

pub async fn handle_delete_device(State(state): State<AppState>, Path(host): Path<String>) -> Response {
    let _guard = state.config_lock.lock().await;

    let mut config = match load_config(&state) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let removed = match flow::remove_device(&mut config, &host) {
        Ok(r) => r,
        Err(e) => return flow_error(e),
    };
    if let Err(resp) = persist(&state, &config).await {
        return resp;
    }
    if let Err(e) = state.store.delete_history_for(&removed) {
        tracing::error!("Failed to delete history for {}: {}", host, e);
    }

    tracing::info!("Removed device {} with {} sensors", host, removed.len());
    StatusCode::NO_CONTENT.into_response()
}

pub async fn handle_update_alerts(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Json(req): Json<AlertUpdate>,
) -> Response {
    let _guard = state.config_lock.lock().await;

    let mut config = match load_config(&state) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = flow::update_alerts(&mut config, &host, &req, &state.notifier.group_names()) {
        return flow_error(e);
    }
    if let Err(resp) = persist(&state, &config).await {
        return resp;
    }

    let snapshot = state.coordinator.snapshot().await;
    let device = build_devices(&config, &snapshot)
        .into_iter()
        .find(|d| d.host == host);
    Json(device).into_response()
}

// ============================================================================
// API: Sensors
// ============================================================================

pub async fn handle_get_sensors(State(state): State<AppState>) -> Response {
    let config = match config_or_default(&state) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let snapshot = state.coordinator.snapshot().await;
    Json(build_sensors(&config, &snapshot)).into_response()
}

pub async fn handle_delete_sensor(
    State(state): State<AppState>,
    Path(unique_id): Path<String>,
) -> Response {
    let _guard = state.config_lock.lock().await;

    let mut config = match load_config(&state) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let removed = match flow::remove_sensor(&mut config, &unique_id) {
        Ok(t) => t,
        Err(e) => return flow_error(e),
    };
    if let Err(resp) = persist(&state, &config).await {
        return resp;
    }
    if let Err(e) = state.store.delete_history_for(std::slice::from_ref(&unique_id)) {
        tracing::error!("Failed to delete history for {}: {}", unique_id, e);
    }

    if config.device_targets(&removed.host).next().is_none() {
        tracing::info!("Removed last sensor of device {}", removed.host);
    }
    StatusCode::NO_CONTENT.into_response()
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub unique_id: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_get_history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> Response {
    let config = match config_or_default(&state) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if config.find_target(&query.unique_id).is_none() {
        return flow_error(FlowError::UnknownSensor(query.unique_id));
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    match state.store.get_history(&query.unique_id, limit) {
        Ok(records) => Json(records).into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Notify groups
// ============================================================================

pub async fn handle_get_notify_groups(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.notifier.group_names())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Notifier;
    use crate::config::ServerConfig;
    use crate::coordinator::Coordinator;
    use crate::db::Store;
    use crate::entity::SensorState;
    use crate::probe::ProbeTimeouts;
    use crate::web::create_router;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::Router;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    fn create_test_app() -> (Router, Arc<Store>, TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("test_web.db")).unwrap());

        let mut groups = BTreeMap::new();
        groups.insert("mobile".to_string(), "http://127.0.0.1:9/hook".to_string());
        let notifier = Notifier::new(groups);

        let timeouts = ProbeTimeouts {
            connect: Duration::from_millis(500),
            ping: Duration::from_millis(500),
        };
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            notifier.clone(),
            timeouts,
            Duration::from_secs(3600),
        ));

        let state = AppState {
            config: ServerConfig::default(),
            store: store.clone(),
            coordinator,
            notifier,
            config_lock: Arc::new(Mutex::new(())),
        };

        // Return dir to keep the database alive
        (create_router(state), store, dir)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    fn parse(body: &str) -> serde_json::Value {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_settings_before_setup() {
        let (app, _store, _dir) = create_test_app();

        let (status, body) = send(&app, "GET", "/api/settings", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(parse(&body)["error"], "not_configured");

        let (status, body) = send(&app, "GET", "/api/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(parse(&body), json!([]));
    }

    #[tokio::test]
    async fn test_add_device_flow() {
        let (app, store, _dir) = create_test_app();

        let (status, body) = send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({
                "host": "127.0.0.1",
                "device_name": "Loopback",
                "protocol": "TCP",
                "port": 1,
                "dns_server": "9.9.9.9",
                "interval": 60,
                "alert_group": "mobile",
                "alert_delay": 5
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let device = parse(&body);
        assert_eq!(device["info"]["name"], "Loopback");
        assert_eq!(device["sensors"][0]["unique_id"], "127.0.0.1_TCP_1");
        assert_eq!(device["alert_group"], "mobile");

        let (status, body) = send(&app, "GET", "/api/settings", None).await;
        assert_eq!(status, StatusCode::OK);
        let settings = parse(&body);
        assert_eq!(settings["dns_server"], "9.9.9.9");
        assert_eq!(settings["interval"], 60);

        // Duplicate
        let (status, body) = send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({ "host": "127.0.0.1", "protocol": "TCP", "port": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse(&body)["error"], "already_configured");

        let stored = store.load_config().unwrap().unwrap();
        assert_eq!(stored.targets.len(), 1);
    }

    #[tokio::test]
    async fn test_add_device_validation() {
        let (app, _store, _dir) = create_test_app();

        let (status, body) = send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({ "host": "h", "protocol": "ICMP", "dns_server": "::1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse(&body)["error"], "invalid_dns_server");

        let (status, body) = send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({ "host": "h", "protocol": "ICMP", "alert_group": "pager" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse(&body)["error"], "unknown_alert_group");
    }

    #[tokio::test]
    async fn test_remove_sensor_and_device() {
        let (app, _store, _dir) = create_test_app();

        let (status, _) = send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({ "host": "dc01.invalid", "protocol": "AD_DC" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = send(&app, "GET", "/api/sensors", None).await;
        assert_eq!(parse(&body).as_array().unwrap().len(), 8);

        let (status, _) = send(&app, "DELETE", "/api/sensors/dc01.invalid_TCP_88", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, "DELETE", "/api/sensors/dc01.invalid_TCP_88", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(parse(&body)["error"], "unknown_sensor");

        let (_, body) = send(&app, "GET", "/api/devices", None).await;
        assert_eq!(parse(&body)[0]["sensors"].as_array().unwrap().len(), 7);

        let (status, _) = send(&app, "DELETE", "/api/devices/dc01.invalid", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = send(&app, "GET", "/api/devices", None).await;
        assert_eq!(parse(&body), json!([]));

        let (status, body) = send(&app, "DELETE", "/api/devices/dc01.invalid", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(parse(&body)["error"], "unknown_device");
    }

    #[tokio::test]
    async fn test_update_alerts_and_settings() {
        let (app, store, _dir) = create_test_app();

        send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({ "host": "127.0.0.1", "protocol": "ICMP" })),
        )
        .await;

        let (status, body) = send(
            &app,
            "PUT",
            "/api/devices/127.0.0.1/alerts",
            Some(json!({ "alert_group": "mobile", "alert_delay": 30 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(parse(&body)["alert_delay"], 30);

        let (status, body) = send(
            &app,
            "PUT",
            "/api/devices/127.0.0.1/alerts",
            Some(json!({ "alert_group": "", "alert_delay": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse(&body)["error"], "invalid_alert_delay");

        let (status, body) = send(
            &app,
            "PUT",
            "/api/settings",
            Some(json!({ "interval": 4, "dns_server": "8.8.8.8" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parse(&body)["error"], "invalid_interval");

        let (status, _) = send(
            &app,
            "PUT",
            "/api/settings",
            Some(json!({ "interval": 30, "dns_server": "8.8.8.8" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let stored = store.load_config().unwrap().unwrap();
        assert_eq!(stored.poll_interval_secs, 30);
        assert_eq!(stored.targets[0].alert_delay, 30);
        assert_eq!(stored.targets[0].alert_group.as_deref(), Some("mobile"));
    }

    #[tokio::test]
    async fn test_history_and_groups() {
        let (app, _store, _dir) = create_test_app();

        let (status, body) = send(&app, "GET", "/api/history?unique_id=nope_TCP_1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(parse(&body)["error"], "unknown_sensor");

        send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({ "host": "127.0.0.1", "protocol": "TCP", "port": 1 })),
        )
        .await;
        let (status, body) = send(&app, "GET", "/api/history?unique_id=127.0.0.1_TCP_1&limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(parse(&body).is_array());

        let (_, body) = send(&app, "GET", "/api/notify-groups", None).await;
        assert_eq!(parse(&body), json!(["mobile"]));
    }

    #[tokio::test]
    async fn test_status_page() {
        let (app, _store, _dir) = create_test_app();

        let (status, body) = send(&app, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("No devices configured"));

        send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({ "host": "127.0.0.1", "device_name": "<lab>", "protocol": "ICMP" })),
        )
        .await;
        let (_, body) = send(&app, "GET", "/", None).await;
        assert!(body.contains("&lt;lab&gt;"));
        assert!(body.contains("ICMP (Ping)"));
    }

    #[tokio::test]
    async fn test_device_name_is_not_a_placeholder() {
        let (app, _store, _dir) = create_test_app();

        send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({ "host": "127.0.0.1", "device_name": "{{rows}}", "protocol": "ICMP" })),
        )
        .await;
        let (status, body) = send(&app, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("&#123;&#123;rows&#125;&#125;"));
        assert!(!body.contains("{{rows}}"));
        // The sensor table appears once, not again in place of the name
        assert_eq!(body.matches("ICMP (Ping)").count(), 1);
    }

    #[test]
    fn test_state_class() {
        assert_eq!(state_class("Partially Connected"), "state-partially-connected");
        assert_eq!(state_class(&SensorState::NotConnected.to_string()), "state-not-connected");
    }
}
