//! First-fit offer matching.

use tracing::debug;

use crate::cluster::{LaunchSpec, Offer};
use crate::tasks::{Task, TaskLifecycle};

/// What to do with one offer.
#[derive(Debug, Clone)]
pub enum OfferDecision {
    Launch { offer: Offer, launch: LaunchSpec },
    Decline { offer: Offer },
}

/// Whether `offer` can host `task`.
pub fn is_feasible(task: &Task, offer: &Offer) -> bool {
    let policy = &task.service.policy;
    offer.resources.covers(&task.requirements())
        && policy.matches_host(&offer.hostname)
        && policy.matches_attributes(|key| offer.attribute(key))
}

/// A unique service may not put a second task on the same agent.
fn agent_is_free(lifecycle: &TaskLifecycle, task: &Task, offer: &Offer) -> bool {
    !task.service.policy.unique
        || !lifecycle
            .table()
            .for_service(task.project(), task.service_name())
            .any(|other| other.state.is_placed() && other.agent_id.as_ref() == Some(&offer.agent_id))
}

/// Resolve every offer to a launch or a decline.
///
/// Pending tasks are tried oldest first and the first feasible one wins the
/// whole offer. Matched tasks move to `Launched` immediately, so a later
/// offer in the same batch cannot pick them again.
pub fn match_offers(lifecycle: &mut TaskLifecycle, offers: Vec<Offer>) -> Vec<OfferDecision> {
    let mut pending = lifecycle.table().pending_fifo();
    let mut decisions = Vec::with_capacity(offers.len());

    for offer in offers {
        let choice = {
            let view: &TaskLifecycle = lifecycle;
            pending.iter().position(|id| {
                view.task(id)
                    .is_some_and(|task| is_feasible(task, &offer) && agent_is_free(view, task, &offer))
            })
        };

        let launch = choice.and_then(|index| {
            let id = pending.remove(index);
            lifecycle.mark_launched(&id, &offer)
        });

        match launch {
            Some(launch) => {
                debug!(
                    offer_id = %offer.id,
                    host = %offer.hostname,
                    task_id = %launch.task_id,
                    "Offer matched"
                );
                decisions.push(OfferDecision::Launch { offer, launch });
            }
            None => decisions.push(OfferDecision::Decline { offer }),
        }
    }

    decisions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Resources;
    use crate::compose::{parse, ParseOptions};
    use crate::desired::resolve_all;
    use crate::tasks::TaskState;
    use mc_id::{AgentId, OfferId};

    fn lifecycle(yaml: &str) -> TaskLifecycle {
        let doc = parse(yaml.as_bytes(), &ParseOptions::default()).unwrap();
        let mut lc = TaskLifecycle::new();
        lc.apply_upsert("shop", resolve_all(doc.services).unwrap());
        lc
    }

    fn offer(id: &str, host: &str, cpus: f64, mem: f64) -> Offer {
        Offer {
            id: OfferId::parse(id).unwrap(),
            agent_id: AgentId::parse(&format!("agent-{host}")).unwrap(),
            hostname: host.to_string(),
            resources: Resources { cpus, mem },
            attributes: [("os".to_string(), "linux".to_string())].into(),
        }
    }

    fn launched(decisions: &[OfferDecision]) -> Vec<String> {
        decisions
            .iter()
            .filter_map(|d| match d {
                OfferDecision::Launch { launch, .. } => Some(launch.task_id.service().to_string()),
                OfferDecision::Decline { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_hostname_constraint() {
        let mut lc = lifecycle(
            "services:\n  web:\n    image: alpine:latest\n    command: sleep 1\n    labels:\n      mesos_compose.placement.hostname: nodeA\n",
        );

        let decisions = match_offers(&mut lc, vec![offer("o1", "nodeB", 4.0, 4096.0)]);
        assert!(matches!(decisions[0], OfferDecision::Decline { .. }));
        assert_eq!(lc.pending_count(), 1);

        let decisions = match_offers(&mut lc, vec![offer("o2", "nodeA", 4.0, 4096.0)]);
        let OfferDecision::Launch { launch, .. } = &decisions[0] else {
            panic!("expected launch");
        };
        let task = lc.task(&launch.task_id).unwrap();
        assert_eq!(task.state, TaskState::Launched);
        assert_eq!(task.host.as_deref(), Some("nodeA"));
        assert_eq!(task.granted, Some(launch.resources));
    }

    #[test]
    fn test_first_fit_skips_infeasible_head() {
        let mut lc = lifecycle(
            "services:\n  big:\n    image: a\n    command: x\n    deploy:\n      resources:\n        limits:\n          cpus: '8'\n  small:\n    image: b\n    command: y\n",
        );

        let decisions = match_offers(&mut lc, vec![offer("o1", "n1", 1.0, 1024.0)]);
        assert_eq!(launched(&decisions), vec!["small"]);
    }

    #[test]
    fn test_one_task_per_offer_and_no_double_match() {
        let mut lc = lifecycle(
            "services:\n  web:\n    image: a\n    command: x\n    deploy:\n      replicas: 2\n",
        );

        let decisions = match_offers(
            &mut lc,
            vec![
                offer("o1", "n1", 16.0, 65536.0),
                offer("o2", "n2", 16.0, 65536.0),
                offer("o3", "n3", 16.0, 65536.0),
            ],
        );
        assert_eq!(launched(&decisions).len(), 2);
        assert!(matches!(decisions[2], OfferDecision::Decline { .. }));
        assert_eq!(lc.pending_count(), 0);
    }

    #[test]
    fn test_attribute_constraint() {
        let mut lc = lifecycle(
            "services:\n  web:\n    image: a\n    command: x\n    deploy:\n      placement:\n        constraints:\n          - node.platform.os==windows\n",
        );
        let decisions = match_offers(&mut lc, vec![offer("o1", "n1", 4.0, 4096.0)]);
        assert!(launched(&decisions).is_empty());
    }

    #[test]
    fn test_matching_is_deterministic() {
        let yaml = "services:\n  a:\n    image: a\n    command: x\n  b:\n    image: b\n    command: y\n";
        let first = {
            let mut lc = lifecycle(yaml);
            launched(&match_offers(&mut lc, vec![offer("o1", "n1", 1.0, 512.0)]))
        };
        for _ in 0..5 {
            let mut lc = lifecycle(yaml);
            assert_eq!(
                launched(&match_offers(&mut lc, vec![offer("o1", "n1", 1.0, 512.0)])),
                first
            );
        }
        assert_eq!(first, vec!["a"]);
    }

    #[test]
    fn test_unique_placement_spreads_across_agents() {
        let mut lc = lifecycle(
            "services:\n  web:\n    image: a\n    command: x\n    labels:\n      __mc_placement: unique\n    deploy:\n      replicas: 2\n",
        );

        let decisions = match_offers(
            &mut lc,
            vec![offer("o1", "n1", 16.0, 65536.0), offer("o2", "n1", 16.0, 65536.0)],
        );
        assert_eq!(launched(&decisions).len(), 1);
        assert!(matches!(decisions[1], OfferDecision::Decline { .. }));
        assert_eq!(lc.pending_count(), 1);

        let decisions = match_offers(&mut lc, vec![offer("o3", "n2", 16.0, 65536.0)]);
        assert_eq!(launched(&decisions).len(), 1);
        assert_eq!(lc.pending_count(), 0);
    }
}
