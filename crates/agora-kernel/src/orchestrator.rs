//! [`ServiceManager`] – ordered start and stop of the kernel services.
//!
//! | Phase | Prioritized services | Un-prioritized services |
//! |---|---|---|
//! | start | one at a time, ascending `start_priority`, each awaited until running | all at once, after every prioritized service is running |
//! | stop | one at a time, ascending `stop_priority`, each awaited until terminated | all signalled up front, awaited last |
//!
//! Services that share a priority keep their registration order.  That order
//! is an implementation detail and services must not depend on it.
//!
//! A prioritized start failure aborts the sequence and is returned to the
//! caller.  Stop failures are logged and never prevent the remaining services
//! from stopping.

use std::sync::Arc;
use std::time::Duration;

use agora_types::AgoraError;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::service::{KernelService, ServiceState};

/// Starts and stops a fixed set of [`KernelService`]s.
pub struct ServiceManager {
    services: Vec<Arc<dyn KernelService>>,
    startup_timeout: Option<Duration>,
}

impl ServiceManager {
    pub fn new(services: Vec<Arc<dyn KernelService>>) -> Self {
        Self {
            services,
            startup_timeout: None,
        }
    }

    /// Bound the readiness wait of every single service.  There is no
    /// timeout unless one is configured.
    pub fn with_startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn services(&self) -> &[Arc<dyn KernelService>] {
        &self.services
    }

    /// Start every service.  Returns once all of them are running, or with
    /// the first failure.
    pub async fn start_all(&self) -> Result<(), AgoraError> {
        let (prioritized, others) = partition(&self.services, |s| s.start_priority());
        info!(
            prioritized = prioritized.len(),
            concurrent = others.len(),
            "starting kernel services"
        );

        for service in prioritized {
            start_one(service, self.startup_timeout).await?;
        }

        let mut pending = JoinSet::new();
        for service in others {
            let timeout = self.startup_timeout;
            pending.spawn(async move { start_one(service, timeout).await });
        }
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(AgoraError::ServiceStartFailed {
                        service: "<concurrent>".to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!("all kernel services running");
        Ok(())
    }

    /// Stop every service.  Returns the first stop failure once every
    /// service has been asked to stop.
    pub async fn stop_all(&self) -> Result<(), AgoraError> {
        let (prioritized, others) = partition(&self.services, |s| s.stop_priority());
        info!(
            prioritized = prioritized.len(),
            concurrent = others.len(),
            "stopping kernel services"
        );

        let mut signalled = JoinSet::new();
        for service in others {
            signalled.spawn(async move {
                let name = service.name().to_string();
                service.stop().await.map_err(|e| (name, e))
            });
        }

        let mut first_failure = None;
        for service in prioritized {
            debug!(service = service.name(), "stopping service");
            if let Err(e) = service.stop().await {
                error!(service = service.name(), error = %e, "service failed to stop");
                first_failure.get_or_insert(stop_failure(service.name(), &e));
            }
        }

        while let Some(joined) = signalled.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((name, e))) => {
                    error!(service = %name, error = %e, "service failed to stop");
                    first_failure.get_or_insert(stop_failure(&name, &e));
                }
                Err(e) => {
                    warn!(error = %e, "stop task did not complete");
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => {
                info!("all kernel services stopped");
                Ok(())
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

/// Split `services` into those with a priority, stably sorted by it, and the
/// rest in registration order.
fn partition(
    services: &[Arc<dyn KernelService>],
    priority: impl Fn(&dyn KernelService) -> Option<u32>,
) -> (Vec<Arc<dyn KernelService>>, Vec<Arc<dyn KernelService>>) {
    let mut prioritized: Vec<(u32, Arc<dyn KernelService>)> = Vec::new();
    let mut others = Vec::new();
    for service in services {
        match priority(service.as_ref()) {
            Some(p) => prioritized.push((p, Arc::clone(service))),
            None => others.push(Arc::clone(service)),
        }
    }
    prioritized.sort_by_key(|(p, _)| *p);
    (prioritized.into_iter().map(|(_, s)| s).collect(), others)
}

async fn start_one(service: Arc<dyn KernelService>, timeout: Option<Duration>) -> Result<(), AgoraError> {
    let name = service.name().to_string();
    debug!(service = %name, "starting service");

    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, service.start())
            .await
            .map_err(|_| AgoraError::StartupTimeout {
                service: name.clone(),
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?,
        None => service.start().await,
    };

    match result {
        Ok(()) if service.state() == ServiceState::Running => {
            info!(service = %name, "service running");
            Ok(())
        }
        Ok(()) => Err(AgoraError::ServiceStartFailed {
            reason: format!("service is {} after start", service.state()),
            service: name,
        }),
        Err(e @ AgoraError::ServiceStartFailed { .. }) => Err(e),
        Err(e) => {
            error!(service = %name, error = %e, "service failed to start");
            Err(AgoraError::ServiceStartFailed {
                service: name,
                reason: e.to_string(),
            })
        }
    }
}

fn stop_failure(service: &str, e: &AgoraError) -> AgoraError {
    match e {
        AgoraError::ServiceStopFailed { service, reason } => AgoraError::ServiceStopFailed {
            service: service.clone(),
            reason: reason.clone(),
        },
        other => AgoraError::ServiceStopFailed {
            service: service.to_string(),
            reason: other.to_string(),
        },
    }
}
