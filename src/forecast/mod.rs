//! Data collaborators the coordinator reads from every tick.
//!
//! Every call is bounded by [`with_timeout`]; a timeout is just another way
//! of saying "data unavailable" and feeds the policy fallbacks.

pub mod prices;
pub mod production;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{PriceSample, PvForecast};

pub use prices::TariffPriceFeed;
pub use production::DaylightPvForecast;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Current slot plus upcoming slots within `horizon`, ordered by time.
    async fn get_current_and_forecast(
        &self,
        horizon: chrono::Duration,
    ) -> Result<(Option<PriceSample>, Vec<PriceSample>), CollaboratorError>;
}

#[async_trait]
pub trait PvForecastService: Send + Sync {
    async fn get(&self, horizon: chrono::Duration) -> Result<PvForecast, CollaboratorError>;
}

/// Run a collaborator call, mapping an elapsed deadline to [`CollaboratorError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(CollaboratorError::Timeout(limit)))
}
