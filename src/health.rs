use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let workers = state.pipeline.workers();
    let busy = workers.size().saturating_sub(workers.idle());

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": "podscript-backend",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "workers": {
            "size": workers.size(),
            "busy": busy,
            "status": load_status(busy, workers.size()),
        },
        "providers": state.pipeline.router().providers(),
        "models": {
            "default": state.local.default_model(),
            "loaded": state
                .local
                .list_models()
                .into_iter()
                .filter(|m| m.loaded)
                .map(|m| m.name)
                .collect::<Vec<_>>(),
        },
        "memory": memory_info(),
    }))
}

fn load_status(busy: usize, size: usize) -> &'static str {
    let usage = busy as f64 / size.max(1) as f64;
    if usage >= 1.0 {
        "saturated"
    } else if usage > 0.7 {
        "busy"
    } else {
        "normal"
    }
}

#[cfg(target_os = "linux")]
fn memory_info() -> serde_json::Value {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return json!({ "available": false });
    };

    let read_kb = |prefix: &str| {
        status
            .lines()
            .find(|line| line.starts_with(prefix))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .unwrap_or(0)
            * 1024
    };

    json!({
        "resident_memory_bytes": read_kb("VmRSS:"),
        "virtual_memory_bytes": read_kb("VmSize:"),
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn memory_info() -> serde_json::Value {
    json!({ "available": false })
}
