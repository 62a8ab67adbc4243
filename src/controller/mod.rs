//! Controller module for the managed Sigstore kinds
//!
//! Holds the reconcile engine (actions, pipelines, the idempotent ensure
//! primitive, recovery and tree resolution), the per-kind pipelines and the
//! kube-rs controller loops that drive them.

pub mod action;
pub mod artifacts;
pub mod conditions;
pub mod ctlog;
pub mod ensure;
pub mod events;
pub mod pipeline;
mod reconciler;
pub mod recovery;
pub mod rekor;
pub mod resources;
pub mod transitions;
pub mod tree;
pub mod trillian;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod resources_test;
#[cfg(test)]
mod tree_test;

pub use action::{ActionContext, ActionResult, ReconcileAction};
pub use events::{EventRecorder, KubeEventRecorder};
pub use pipeline::{PassOutcome, Pipeline};
pub use reconciler::{run_controller, ControllerState};
