#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use trafficredirect_controller_core as core;
pub use trafficredirect_controller_k8s_api as k8s;
pub use trafficredirect_controller_sync as sync;
pub use trafficredirect_controller_tower as platform;

mod admission;
mod args;
mod duration;
mod lease;
mod validation;

pub use self::{args::Args, duration::Period};
