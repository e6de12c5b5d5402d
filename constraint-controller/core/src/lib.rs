#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod enforcement_action;
pub mod engine;
pub mod readiness;
pub mod status_cache;

pub use self::{
    enforcement_action::{ActionError, EnforcementAction},
    engine::{EngineError, PolicyEngine},
    readiness::ReadinessTracker,
    status_cache::{Status, StatusCache, Tags},
};
