//! telemetry-k8s: Kubernetes operator for telemetry pipelines
//!
//! Users declare log, metric and trace pipelines as custom resources; the
//! operator validates them, renders collector configuration, runs the
//! gateway and agent workloads that carry the data, and reports health
//! back on each resource's status.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
