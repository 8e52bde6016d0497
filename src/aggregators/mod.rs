//! Aggregation of client gradient sets.
//!
//! The coordinator uses plain federated averaging: [`fedavg`] computes the
//! mean gradient and [`apply_step`] moves the global model one step against it.

pub mod fedavg;

pub use fedavg::{apply_step, fedavg};
