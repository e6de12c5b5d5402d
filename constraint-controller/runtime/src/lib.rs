#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gatekeeper_constraint_controller_core as core;
pub use gatekeeper_constraint_controller_k8s_api as k8s;
pub use gatekeeper_constraint_controller_k8s_binding as binding;
pub use gatekeeper_constraint_controller_k8s_reconcile as reconcile;

mod args;
pub mod queue;
pub mod watches;

pub use self::args::Args;
