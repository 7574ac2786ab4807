//! Entity-set schema validation.
//!
//! Before commit, every edge endpoint must resolve against the node subset
//! of the same ingestion (or the commit would write dangling merges).
//! Errors accumulate — one per missing endpoint — and never short-circuit.

use std::collections::HashSet;

use lattice_core::Entity;

struct RefIndexes {
    service_ids: HashSet<String>,
    topic_names: HashSet<String>,
    deployment_ids: HashSet<String>,
}

fn build_ref_indexes(entities: &[Entity]) -> RefIndexes {
    let mut service_ids = HashSet::new();
    let mut topic_names = HashSet::new();
    let mut deployment_ids = HashSet::new();
    for entity in entities {
        match entity {
            Entity::Service(n) => {
                service_ids.insert(n.id.clone());
            }
            Entity::KafkaTopic(n) => {
                topic_names.insert(n.name.clone());
            }
            Entity::K8sDeployment(n) => {
                deployment_ids.insert(n.id.clone());
            }
            _ => {}
        }
    }
    RefIndexes {
        service_ids,
        topic_names,
        deployment_ids,
    }
}

/// Validate the topology of an entity set. Returns human-readable errors;
/// an empty list means the set is commit-ready.
pub fn validate_topology(entities: &[Entity]) -> Vec<String> {
    let mut errors: Vec<String> = Vec::new();

    // Field-level validation first (identifier shape, tenant presence).
    for entity in entities {
        if let Err(err) = entity.validate() {
            errors.push(format!("{}: {err}", entity.type_name()));
        }
    }

    let refs = build_ref_indexes(entities);

    for entity in entities {
        match entity {
            Entity::Calls(edge) => {
                if !refs.service_ids.contains(&edge.source_service_id) {
                    errors.push(format!(
                        "CallsEdge references unknown source service: {}",
                        edge.source_service_id
                    ));
                }
                if !refs.service_ids.contains(&edge.target_service_id) {
                    errors.push(format!(
                        "CallsEdge references unknown target service: {}",
                        edge.target_service_id
                    ));
                }
            }
            Entity::Produces(edge) => {
                if !refs.service_ids.contains(&edge.service_id) {
                    errors.push(format!(
                        "ProducesEdge references unknown service: {}",
                        edge.service_id
                    ));
                }
                if !refs.topic_names.contains(&edge.topic_name) {
                    errors.push(format!(
                        "ProducesEdge references unknown topic: {}",
                        edge.topic_name
                    ));
                }
            }
            Entity::Consumes(edge) => {
                if !refs.service_ids.contains(&edge.service_id) {
                    errors.push(format!(
                        "ConsumesEdge references unknown service: {}",
                        edge.service_id
                    ));
                }
                if !refs.topic_names.contains(&edge.topic_name) {
                    errors.push(format!(
                        "ConsumesEdge references unknown topic: {}",
                        edge.topic_name
                    ));
                }
            }
            Entity::DeployedIn(edge) => {
                if !refs.service_ids.contains(&edge.service_id) {
                    errors.push(format!(
                        "DeployedInEdge references unknown service: {}",
                        edge.service_id
                    ));
                }
                if !refs.deployment_ids.contains(&edge.deployment_id) {
                    errors.push(format!(
                        "DeployedInEdge references unknown deployment: {}",
                        edge.deployment_id
                    ));
                }
            }
            _ => {}
        }
    }

    errors
}
