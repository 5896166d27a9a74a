//! 健康检查路由（各服务共用）/ Health check routes shared by every service

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpServer, Responder};
use std::sync::Arc;

use crate::response::respond_any;
use crate::HealthCheck;

/// 共享的健康检查对象 / Shared health checker
pub type SharedHealth = Arc<dyn HealthCheck>;

/// 路由注册入口（GET）/ Route registration entry (GET)
pub fn configure_health_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/v1/health").route(web::get().to(health_basic_handle)));
    cfg.service(web::resource("/v1/health/live").route(web::get().to(health_live_handle)));
    cfg.service(web::resource("/v1/health/ready").route(web::get().to(health_ready_handle)));
}

// 基础健康检查 / Basic health check
async fn health_basic_handle(checker: web::Data<SharedHealth>) -> impl Responder {
    let status = checker.check_health().await;
    let code = if status.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    respond_any(code, status)
}

// 存活检查：进程能响应即存活 / Liveness: responding means alive
async fn health_live_handle() -> impl Responder {
    respond_any(
        StatusCode::OK,
        serde_json::json!({ "alive": true, "timestamp": chrono::Utc::now().timestamp_millis() }),
    )
}

// 就绪检查 / Readiness check
async fn health_ready_handle(checker: web::Data<SharedHealth>) -> impl Responder {
    let status = checker.check_health().await;
    let code = if status.ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    respond_any(
        code,
        serde_json::json!({
            "ready": status.ready,
            "service": status.component,
            "message": status.message,
            "timestamp": status.timestamp.timestamp_millis(),
        }),
    )
}

/// 启动健康检查 HTTP 服务 / Run the health HTTP server until it stops
pub async fn serve_health(checker: SharedHealth, host: String, port: u16) -> anyhow::Result<()> {
    tracing::info!("🌐 Health endpoints listening on {}:{}", host, port);
    let data = web::Data::new(checker);
    HttpServer::new(move || App::new().app_data(data.clone()).configure(configure_health_routes))
        .workers(1)
        .disable_signals()
        .bind((host.as_str(), port))?
        .run()
        .await?;
    Ok(())
}
