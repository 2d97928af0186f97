#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod derive;
pub mod key;
mod nic;
mod source;

pub use self::{
    derive::{desired_rules, DesiredRules},
    key::RuleKey,
    nic::Nic,
    source::{ChangeAction, NicChange, NicSource},
};
pub use trafficredirect_controller_k8s_api::RuleDirection as Direction;

/// All rule records managed by the controller live in this namespace.
pub const RULE_NAMESPACE: &str = "tower-space";

pub const CONTROLLER_NAME: &str = "tr.everoute.io/vnic-controller";
