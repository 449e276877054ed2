//! Delivery Tracker
//!
//! Two halves share one crate:
//!
//! - **Live order tracking**: a [`TrackingClient`] seeds each watched order
//!   from the REST snapshot endpoint, then folds WebSocket events into a
//!   per-order [`TrackingSnapshot`] that observers read through an
//!   [`OrderWatch`].
//! - **Driver fulfillment**: a [`DriverConsole`] loads the day's deliveries,
//!   validates status transitions locally and routes every completion
//!   through the confirmation gate before calling the backend.
//!
//! [`Services`] wires both halves to one [`Config`].

use std::sync::Arc;

use tracing::info;

pub mod api;
pub mod config;
pub mod confirmation;
pub mod connection;
pub mod console;
pub mod deliveries;
pub mod error;
pub mod logging;
pub mod reducer;
pub mod scheduler;
pub mod subscriptions;
pub mod tracking;
pub mod wire;

pub use api::ApiClient;
pub use config::Config;
pub use confirmation::{ConfirmationGate, ConfirmationRequest, Resolution};
pub use connection::{ConnectionManager, WsConnector};
pub use console::{ConsoleStep, DriverConsole, Intent};
pub use deliveries::{
    BulkOutcome, DailyDeliveriesQuery, DeliveryRecord, DeliveryStats, DeliveryStatus,
    DeliveryStatusEngine, Shift,
};
pub use error::{ConfigError, DeliveryError, TrackingError};
pub use reducer::TrackingSnapshot;
pub use tracking::{OrderWatch, ReconnectPolicy, TrackingClient, TrackingClientConfig};

/// Shared HTTP client plus the config it was built from.
pub struct Services {
    config: Config,
    api: Arc<ApiClient>,
}

impl Services {
    pub fn from_config(config: Config) -> Result<Self, String> {
        let api = ApiClient::new(
            &config.api_url,
            config.auth_token.clone(),
            config.request_timeout,
        )?;
        info!(api_url = %api.base_url(), socket_url = %config.socket_url, "Delivery services configured");
        Ok(Self {
            config,
            api: Arc::new(api),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    /// A tracking client over a fresh WebSocket connection manager. Call
    /// [`TrackingClient::start`] before watching orders.
    pub fn tracking_client(&self) -> TrackingClient {
        let connection = Arc::new(ConnectionManager::new(Arc::new(WsConnector::default())));
        TrackingClient::new(self.config.tracking_config(), self.api.clone(), connection)
    }

    /// Start a tracking client with the configured token and user id.
    pub fn start_tracking(&self) -> Result<TrackingClient, TrackingError> {
        let client = self.tracking_client();
        client.start(&self.config.auth_token, self.config.user_id.as_deref())?;
        Ok(client)
    }

    /// A driver console for the configured driver. Fails without a driver id.
    pub fn driver_console(&self) -> Result<DriverConsole, ConfigError> {
        let driver_id = self.config.require_driver_id()?;
        Ok(DriverConsole::new(self.api.clone(), driver_id))
    }
}
