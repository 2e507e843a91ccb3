use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::state::LinkView;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("vehicle not connected")]
    NotConnected,
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("no acknowledgement for {0} within {1:?}")]
    Timeout(&'static str, Duration),
    #[error("vehicle link error: {0}")]
    Link(String),
}

/// High-level flight actions a source can carry out.
#[async_trait]
pub trait VehicleActions: Send + Sync {
    async fn arm(&self) -> Result<(), CommandError>;
    async fn disarm(&self) -> Result<(), CommandError>;
    async fn takeoff(&self, altitude_m: f32) -> Result<(), CommandError>;
    async fn land(&self) -> Result<(), CommandError>;
}

/// Gates commands on the link being connected before handing them to the
/// active source.
#[derive(Clone)]
pub struct Commander {
    view: LinkView,
    actions: Arc<dyn VehicleActions>,
}

impl Commander {
    pub fn new(view: LinkView, actions: Arc<dyn VehicleActions>) -> Self {
        Self { view, actions }
    }

    fn ensure_connected(&self) -> Result<(), CommandError> {
        if self.view.is_connected() {
            Ok(())
        } else {
            Err(CommandError::NotConnected)
        }
    }

    pub async fn arm(&self) -> Result<(), CommandError> {
        self.ensure_connected()?;
        info!("vehicle: arming");
        self.actions.arm().await
    }

    pub async fn disarm(&self) -> Result<(), CommandError> {
        self.ensure_connected()?;
        info!("vehicle: disarming");
        self.actions.disarm().await
    }

    pub async fn takeoff(&self, altitude_m: f32) -> Result<(), CommandError> {
        self.ensure_connected()?;
        if !altitude_m.is_finite() || altitude_m <= 0.0 {
            return Err(CommandError::Rejected(format!("invalid takeoff altitude {}", altitude_m)));
        }
        info!("vehicle: taking off to {}m", altitude_m);
        self.actions.takeoff(altitude_m).await
    }

    pub async fn land(&self) -> Result<(), CommandError> {
        self.ensure_connected()?;
        info!("vehicle: landing");
        self.actions.land().await
    }
}
