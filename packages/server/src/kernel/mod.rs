pub mod bus;
pub mod classifier;
pub mod jobs;
pub mod maintenance;
pub mod metrics;
pub mod service_host;
pub mod services;

pub use bus::{BusPublisher, NatsBusPublisher, TestBus};
pub use metrics::Metrics;
pub use service_host::{Service, ServiceHost};
