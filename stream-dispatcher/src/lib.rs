pub mod balancer;
pub mod config;
pub mod converter;
pub mod dispatcher;
pub mod error;
pub mod flow;
pub mod metrics_const;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod watch;
