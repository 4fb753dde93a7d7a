//! Infrastructure layer: configuration, logging and the remote collaborators
//!
//! Everything that talks to the outside world lives here: the rate-limited HTTP
//! client, the dashboard job runner, the inventory lookup client, the token
//! source, the notification sinks and the system resource sampler.

pub mod config;
pub mod dashboard_client;
pub mod http_client;
pub mod inventory_api;
pub mod job_source;
pub mod logging;
pub mod resource_monitor;
pub mod token_source;
pub mod webhook;

pub use config::{AppConfig, ConfigManager};
pub use dashboard_client::DashboardJobRunner;
pub use http_client::{HttpClient, HttpClientConfig, HttpError};
pub use inventory_api::InventoryApiClient;
pub use job_source::load_jobs;
pub use logging::{bootstrap_subscriber, get_log_directory, init_logging, init_logging_with_config};
pub use resource_monitor::SystemResourceSampler;
pub use token_source::HttpTokenSource;
pub use webhook::{LogSink, WebhookSink};
