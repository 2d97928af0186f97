use std::{fmt, str::FromStr};

/// Redirects traffic matching a NIC's MAC address for deep packet inspection.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "tr.everoute.io",
    version = "v1alpha1",
    kind = "Rule",
    plural = "rules",
    shortname = "trr",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"direct","type":"string","jsonPath":".spec.direct"}"#,
    printcolumn = r#"{"name":"src-mac","type":"string","jsonPath":".spec.match.srcMac"}"#,
    printcolumn = r#"{"name":"dst-mac","type":"string","jsonPath":".spec.match.dstMac"}"#,
    printcolumn = r#"{"name":"vm","type":"string","jsonPath":".spec.option.towerVM"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(rename = "match")]
    pub mac_match: RuleMatch,

    pub direct: RuleDirection,

    /// Debugging information about the VM that owns the matched NIC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<RuleOption>,
}

/// Exactly one of the MAC addresses is expected to be set.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src_mac: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst_mac: String,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct RuleOption {
    #[serde(rename = "towerVM", default, skip_serializing_if = "String::is_empty")]
    pub tower_vm: String,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    #[default]
    Ingress,
    Egress,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid rule direction: {0}")]
pub struct InvalidDirection(String);

// === impl RuleDirection ===

impl RuleDirection {
    pub const ALL: [Self; 2] = [Self::Ingress, Self::Egress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

impl fmt::Display for RuleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleDirection {
    type Err = InvalidDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(Self::Ingress),
            "egress" => Ok(Self::Egress),
            s => Err(InvalidDirection(s.to_string())),
        }
    }
}
