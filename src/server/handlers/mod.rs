pub mod health;
pub mod history;
pub mod metrics;
pub mod proxy;
