pub mod agent;
pub mod analytics;
pub mod config;
pub mod confirm;
pub mod context;
pub mod decision;
pub mod exchange;
pub mod execution;
pub mod learning;
pub mod notify;
pub mod oracle;
pub mod signals;
pub mod store;

pub use agent::Agent;
pub use config::Config;
