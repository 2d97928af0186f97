#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod rule;

pub use self::rule::{Rule, RuleDirection, RuleMatch, RuleOption, RuleSpec};
pub use k8s_openapi::api::{self, coordination::v1::Lease};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, CustomResourceExt, Error, Resource,
};
