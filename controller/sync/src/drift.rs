use crate::queue::WorkQueue;
use futures::prelude::*;
use kube::runtime::watcher::Event;
use tracing::trace;
use trafficredirect_controller_core::{RuleKey, RULE_NAMESPACE};
use trafficredirect_controller_k8s_api::{ResourceExt, Rule};

/// Watches rule records, enqueueing the owning NIC of every derived rule
/// that changes so that modified or deleted rules are restored.
///
/// The initial listing enqueues every existing derived rule, which removes
/// rules whose NIC disappeared while the controller was not running.
pub async fn watch_rules<S>(rules: S, queue: WorkQueue<String>)
where
    S: Stream<Item = Event<Rule>>,
{
    tokio::pin!(rules);
    while let Some(event) = rules.next().await {
        match event {
            Event::Apply(rule) | Event::InitApply(rule) | Event::Delete(rule) => {
                if let Some(nic_id) = owning_nic(&rule) {
                    trace!(rule = %rule.name_any(), %nic_id, "Rule changed");
                    queue.add(nic_id);
                }
            }
            Event::Init | Event::InitDone => {}
        }
    }
}

/// Returns the id of the NIC a rule was derived from, if the rule was
/// derived by this controller.
fn owning_nic(rule: &Rule) -> Option<String> {
    if rule.namespace().as_deref() != Some(RULE_NAMESPACE) {
        return None;
    }
    RuleKey::parse(&rule.name_any()).map(|key| key.nic_id)
}
