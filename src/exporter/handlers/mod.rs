mod health;
mod metrics;

pub use self::{health::health, metrics::metrics};
