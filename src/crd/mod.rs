//! Custom Resource Definitions for Sigstore-K8s
//!
//! This module defines the Kubernetes CRDs for the managed Sigstore components.

mod ctlog;
mod rekor;
mod trillian;
pub mod types;


pub use ctlog::{CTlog, CTlogSpec, CTlogStatus};
pub use rekor::{Rekor, RekorSpec, RekorStatus};
pub use trillian::{Trillian, TrillianSpec, TrillianStatus};
pub use types::*;
