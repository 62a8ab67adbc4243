//! Sigstore-K8s: Kubernetes operator for Sigstore transparency services
//!
//! This crate provides a Kubernetes operator that stands up Trillian,
//! Rekor and certificate transparency log servers from custom resources.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod store;
pub mod telemetry;

pub use crate::error::{Error, Result};
