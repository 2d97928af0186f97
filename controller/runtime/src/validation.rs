use crate::k8s::{RuleMatch, RuleSpec};
use regex::Regex;
use thiserror::Error;

/// Matches a lowercase, colon-separated, 48-bit MAC address.
const MAC_REGEX: &str = r"^([0-9a-f]{2}:){5}[0-9a-f]{2}$";

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum RuleError {
    #[error("rule must match a source or destination MAC")]
    MissingMatch,

    #[error("mac {0} is invalid, doesn't match {regex}", regex = MAC_REGEX)]
    InvalidMac(String),

    #[error("rule option must set towerVM")]
    IncompleteOption,
}

/// Validates a rule spec. MACs must already be normalized.
///
/// The direction is validated when the spec is parsed.
pub(crate) fn validate_rule(spec: &RuleSpec) -> Result<(), RuleError> {
    let RuleMatch { src_mac, dst_mac } = &spec.mac_match;
    if src_mac.is_empty() && dst_mac.is_empty() {
        return Err(RuleError::MissingMatch);
    }

    let regex = Regex::new(MAC_REGEX).expect("should_compile");
    for mac in [src_mac, dst_mac] {
        if !mac.is_empty() && !regex.is_match(mac) {
            return Err(RuleError::InvalidMac(mac.clone()));
        }
    }

    if let Some(option) = &spec.option {
        if option.tower_vm.is_empty() {
            return Err(RuleError::IncompleteOption);
        }
    }

    Ok(())
}

/// Lowercases a spec's MACs, returning the MACs that changed.
pub(crate) fn normalize_macs(spec: &mut RuleSpec) -> NormalizedMacs {
    fn lowercase(mac: &mut String) -> Option<String> {
        let lower = mac.to_ascii_lowercase();
        if lower == *mac {
            return None;
        }
        *mac = lower.clone();
        Some(lower)
    }

    NormalizedMacs {
        src_mac: lowercase(&mut spec.mac_match.src_mac),
        dst_mac: lowercase(&mut spec.mac_match.dst_mac),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct NormalizedMacs {
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
}
