use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use log::{error, info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use utoipa::ToSchema;

use crate::config::{Config, HttpdConfig};
use crate::coordinator::{CommandError, GatewayCommand, GatewayRegistry, GatewayState};
use crate::models::Information;
use crate::mqtt::{get_app_status, MqttConnectionStatus};

pub struct ApiManager {
    httpd: HttpdConfig,
    state: web::Data<ApiState>,
}

pub struct ApiState {
    pub registry: GatewayRegistry,
    /// Already masked
    pub config: Config,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub mqtt: MqttHealthInfo,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Serialize, ToSchema)]
pub struct MqttHealthInfo {
    pub status: String,
    pub last_connected_ago_seconds: Option<u64>,
    pub last_message_sent_ago_seconds: Option<u64>,
    pub last_message_received_ago_seconds: Option<u64>,
    pub connection_attempts: u64,
}

#[derive(Serialize, ToSchema)]
pub struct GatewayResponse {
    pub name: String,
    pub vendor: String,
    pub available: bool,
    pub last_error: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub information: Option<Information>,
}

impl From<GatewayState> for GatewayResponse {
    fn from(state: GatewayState) -> Self {
        GatewayResponse {
            name: state.name,
            vendor: state.vendor.to_string(),
            available: state.available,
            last_error: state.last_error,
            information: state.information,
        }
    }
}

#[utoipa::path(get,
    path = "/health",
    summary = "Health check endpoint for container monitoring",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy")
    ),
)]
async fn health_check() -> impl Responder {
    let app_status = get_app_status().await;
    let mqtt_health = &app_status.mqtt_health;
    let now = std::time::Instant::now();
    let system_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let last_connected_ago = mqtt_health.last_connected
        .map(|t| now.duration_since(t).as_secs());
    let last_message_sent_ago = mqtt_health.last_message_sent
        .map(|t| now.duration_since(t).as_secs());
    let last_message_received_ago = mqtt_health.last_message_received
        .map(|t| now.duration_since(t).as_secs());

    let mqtt_status = match &mqtt_health.status {
        MqttConnectionStatus::Connected => "connected",
        MqttConnectionStatus::Disconnected => "disconnected",
        MqttConnectionStatus::Reconnecting => "reconnecting",
        MqttConnectionStatus::Error(_) => "error",
    };

    /* Gateways are polled every few minutes, so a quiet connection is fine */
    let overall_healthy = matches!(mqtt_health.status, MqttConnectionStatus::Connected);

    let response = HealthResponse {
        status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
        mqtt: MqttHealthInfo {
            status: mqtt_status.to_string(),
            last_connected_ago_seconds: last_connected_ago,
            last_message_sent_ago_seconds: last_message_sent_ago,
            last_message_received_ago_seconds: last_message_received_ago,
            connection_attempts: mqtt_health.connection_attempts,
        },
        uptime_seconds: app_status.uptime_seconds(),
        timestamp: system_time,
    };

    if overall_healthy {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

#[utoipa::path(get,
    path = "/api/v1/config",
    summary = "Get the running configuration, credentials are masked",
    responses(
        (status = 200, description = "Get current running config")
    ),
)]
async fn get_config(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(&state.config)
}

#[utoipa::path(get,
    path = "/api/v1/gateways",
    summary = "Get all gateways with their availability and latest readings",
    responses(
        (status = 200, description = "List of gateways", body = Vec<GatewayResponse>)
    ),
)]
async fn list_gateways(state: web::Data<ApiState>) -> impl Responder {
    let gateways: Vec<GatewayResponse> = state.registry.list().await
        .into_iter()
        .map(GatewayResponse::from)
        .collect();
    HttpResponse::Ok().json(gateways)
}

#[utoipa::path(get,
    path = "/api/v1/gateways/{name}",
    summary = "Get one gateway with its availability and latest readings",
    params(
        ("name", description = "Name of the gateway")
    ),
    responses(
        (status = 200, description = "The gateway", body = GatewayResponse),
        (status = 404, description = "The gateway is not configured")
    ),
)]
async fn get_gateway(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let name = path.into_inner();
    match state.registry.get(&name).await {
        Some(gw) => HttpResponse::Ok().json(GatewayResponse::from(gw)),
        None => HttpResponse::NotFound().content_type("text/plain").body(format!("Gateway '{}' not found", name)),
    }
}

#[utoipa::path(post,
    path = "/api/v1/gateways/{name}/reboot",
    summary = "Reboot a gateway, the request is queued behind a running poll",
    params(
        ("name", description = "Name of the gateway")
    ),
    responses(
        (status = 202, description = "Reboot was requested"),
        (status = 404, description = "The gateway is not configured"),
        (status = 503, description = "The gateway does not take commands")
    ),
)]
async fn reboot_gateway(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let name = path.into_inner();
    info!("Reboot of {name} requested via API");

    match state.registry.send_command(&name, GatewayCommand::Reboot).await {
        Ok(_) => HttpResponse::Accepted().json(serde_json::json!({
            "status": "reboot_requested",
            "gateway": name,
        })),
        Err(e @ CommandError::UnknownGateway(_)) => HttpResponse::NotFound().content_type("text/plain").body(e.to_string()),
        Err(e @ CommandError::Closed(_)) => {
            warn!("{e}");
            HttpResponse::ServiceUnavailable().content_type("text/plain").body(e.to_string())
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(description = "smgw2mqtt API description"),
    paths(
            health_check,
            get_config,
            list_gateways,
            get_gateway,
            reboot_gateway,
    )
)]
struct ApiDoc;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        .route("/health", web::get().to(health_check))
        .route("/api/v1/config", web::get().to(get_config))
        .route("/api/v1/gateways", web::get().to(list_gateways))
        .route("/api/v1/gateways/{name}", web::get().to(get_gateway))
        .route("/api/v1/gateways/{name}/reboot", web::post().to(reboot_gateway));
}

impl ApiManager {
    pub fn new(config: &Config, registry: GatewayRegistry) -> Self {
        return ApiManager {
            httpd: config.httpd.clone(),
            state: web::Data::new(ApiState { registry, config: config.masked() }),
        };
    }

    pub async fn start_thread(&self) {
        if !self.httpd.enabled {
            info!("Webserver is disabled");
            return;
        }

        let state = self.state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .configure(configure)
                .service(
                    SwaggerUi::new("/swagger-ui/{_:.*}")
                        .url("/api/v1/openapi.json", ApiDoc::openapi()),
                )
        })
        .bind(format!("0.0.0.0:{}", self.httpd.port));

        let server = match server {
            Ok(s) => s,
            Err(e) => {
                error!("Unable to bind webserver to port {}: {e}", self.httpd.port);
                return;
            }
        };

        info!("Webserver listening on port {}", self.httpd.port);
        if let Err(e) = server.run().await {
            error!("Webserver stopped: {e}");
        }
    }
}
