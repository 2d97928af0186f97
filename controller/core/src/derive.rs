use crate::{Direction, Nic, RuleKey, RULE_NAMESPACE};
use trafficredirect_controller_k8s_api::{ObjectMeta, Rule, RuleMatch, RuleOption, RuleSpec};

/// The pair of rule specs a DPI-enabled NIC should have.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredRules {
    pub ingress: RuleSpec,
    pub egress: RuleSpec,
}

/// Derives both rule specs for a NIC.
///
/// Ingress rules match traffic destined to the NIC's MAC; egress rules match
/// traffic sourced from it. This does not consider whether DPI is enabled.
pub fn desired_rules(nic: &Nic) -> DesiredRules {
    DesiredRules {
        ingress: rule_spec(nic, Direction::Ingress),
        egress: rule_spec(nic, Direction::Egress),
    }
}

fn rule_spec(nic: &Nic, direct: Direction) -> RuleSpec {
    let mac = nic.mac_address.clone();
    let mac_match = match direct {
        Direction::Ingress => RuleMatch {
            dst_mac: mac,
            ..Default::default()
        },
        Direction::Egress => RuleMatch {
            src_mac: mac,
            ..Default::default()
        },
    };
    RuleSpec {
        mac_match,
        direct,
        option: Some(RuleOption {
            tower_vm: nic.owner_vm_id.clone(),
        }),
    }
}

// === impl DesiredRules ===

impl DesiredRules {
    pub fn get(&self, direction: Direction) -> &RuleSpec {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    /// Builds a new rule record for the given NIC & direction.
    pub fn to_rule(&self, nic_id: &str, direction: Direction) -> Rule {
        Rule {
            metadata: ObjectMeta {
                name: Some(RuleKey::new(nic_id, direction).name()),
                namespace: Some(RULE_NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: self.get(direction).clone(),
        }
    }
}
