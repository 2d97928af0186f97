//! Names rule records after the NIC and direction they were derived from.
//!
//! A rule name has exactly three `-`-delimited segments:
//!
//! ```text
//! vnic-<nic id>-<ingress|egress>
//! ```
//!
//! Names that don't have this shape belong to someone else and are ignored.
//! NIC ids that themselves contain a `-` produce names that can't be parsed
//! back.

use crate::Direction;
use std::fmt;

pub const RULE_PREFIX: &str = "vnic";

const DELIMITER: char = '-';

/// Identifies a derived rule by its owning NIC and direction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub nic_id: String,
    pub direction: Direction,
}

// === impl RuleKey ===

impl RuleKey {
    pub fn new(nic_id: impl ToString, direction: Direction) -> Self {
        Self {
            nic_id: nic_id.to_string(),
            direction,
        }
    }

    /// Returns the keys of both rules derived from a NIC.
    pub fn both(nic_id: &str) -> [Self; 2] {
        Direction::ALL.map(|direction| Self::new(nic_id, direction))
    }

    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Parses a rule name, returning `None` if the rule was not derived by
    /// this controller.
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split(DELIMITER);
        let (prefix, nic_id, direction) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || prefix != RULE_PREFIX || nic_id.is_empty() {
            return None;
        }
        let direction = direction.parse().ok()?;
        Some(Self::new(nic_id, direction))
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{RULE_PREFIX}{DELIMITER}{}{DELIMITER}{}",
            self.nic_id, self.direction
        )
    }
}
