use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Liveness reporting for the long-running loops of a process.
///
/// Each loop (the ingestion coordinator, the persistence worker) registers a
/// component with a deadline and reports healthy from inside the loop. The
/// process is healthy only when every registered component reported within
/// its deadline and none reported itself unhealthy. A component that misses
/// its deadline shows up as `Stalled`.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every component is healthy.
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let components: serde_json::Map<String, serde_json::Value> = self
            .components
            .iter()
            .map(|(name, status)| (name.clone(), status.label().into()))
            .collect();
        let body = serde_json::json!({
            "healthy": self.healthy,
            "components": components,
        });

        let status = match self.healthy {
            true => StatusCode::OK,
            false => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first report.
    Starting,
    /// Reported healthy, must report again before the date.
    HealthyUntil(time::OffsetDateTime),
    Unhealthy,
    /// The `HealthyUntil` deadline passed.
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            _ => false,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ComponentStatus::Starting => "starting",
            ComponentStatus::HealthyUntil(_) => "healthy",
            ComponentStatus::Unhealthy => "unhealthy",
            ComponentStatus::Stalled => "stalled",
        }
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy until now + deadline. Returns once the message is queued.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime: status updates are applied
    /// by a background task.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Probes fail from here on and the process gets restarted.
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    /// Register a component. Pass the handle to the loop it monitors.
    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Status of the whole process. Usable as the body of an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let now = time::OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if until.le(&now) => ComponentStatus::Stalled,
                status => status.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            _ = result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
