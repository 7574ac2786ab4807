//! Query templates and natural-language intent matching.
//!
//! A small catalog of parameterized statements for the questions operators
//! actually ask. Every template is tenant-scoped, ACL-guarded, and filters
//! tombstoned edges; the matcher extracts parameters from the query text
//! with conservative regexes and leaves anything ambiguous to the traversal
//! engine instead.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// A named, parameterized graph statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTemplate {
    pub name: &'static str,
    pub cypher: &'static str,
    pub parameters: &'static [&'static str],
    pub description: &'static str,
}

/// A matched template plus the parameters extracted from the question.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMatch {
    pub template_name: String,
    pub params: HashMap<String, String>,
}

const BLAST_RADIUS_CYPHER: &str =
    "MATCH (s:Service {name: $name, tenant_id: $tenant_id})\
     -[rels:CALLS|PRODUCES|CONSUMES*1..3]->(downstream) \
     WHERE downstream.tenant_id = $tenant_id \
     AND ALL(rel IN rels WHERE rel.tombstoned_at IS NULL) \
     AND ($is_admin OR downstream.team_owner = $acl_team \
     OR ANY(ns IN downstream.namespace_acl WHERE ns IN $acl_namespaces)) \
     RETURN DISTINCT downstream.name AS affected_service, \
     labels(downstream)[0] AS node_type \
     ORDER BY affected_service";

const DEPENDENCY_COUNT_CYPHER: &str =
    "MATCH (caller:Service {tenant_id: $tenant_id})\
     -[c:CALLS]->(target:Service {tenant_id: $tenant_id}) \
     WHERE c.tombstoned_at IS NULL \
     AND ($is_admin OR target.team_owner = $acl_team \
     OR ANY(ns IN target.namespace_acl WHERE ns IN $acl_namespaces)) \
     RETURN target.name AS service, count(caller) AS inbound_dependency_count \
     ORDER BY inbound_dependency_count DESC \
     LIMIT $limit";

const SERVICE_NEIGHBORS_CYPHER: &str =
    "MATCH (s:Service {name: $name, tenant_id: $tenant_id})-[r]-(neighbor) \
     WHERE neighbor.tenant_id = $tenant_id \
     AND r.tombstoned_at IS NULL \
     AND ($is_admin OR neighbor.team_owner = $acl_team \
     OR ANY(ns IN neighbor.namespace_acl WHERE ns IN $acl_namespaces)) \
     RETURN s.name AS source, type(r) AS relationship, \
     neighbor.name AS target, labels(neighbor)[0] AS target_type \
     ORDER BY relationship, target";

const TOPIC_CONSUMERS_CYPHER: &str =
    "MATCH (consumer:Service {tenant_id: $tenant_id})\
     -[c:CONSUMES]->(t:KafkaTopic {name: $topic_name, tenant_id: $tenant_id}) \
     WHERE c.tombstoned_at IS NULL \
     AND ($is_admin OR consumer.team_owner = $acl_team \
     OR ANY(ns IN consumer.namespace_acl WHERE ns IN $acl_namespaces)) \
     RETURN consumer.name AS consumer_service, t.name AS topic \
     ORDER BY consumer_service";

static TEMPLATES: Lazy<Vec<QueryTemplate>> = Lazy::new(|| {
    vec![
        QueryTemplate {
            name: "blast_radius",
            cypher: BLAST_RADIUS_CYPHER,
            parameters: &["name"],
            description: "Transitive downstream blast radius from a service failure",
        },
        QueryTemplate {
            name: "dependency_count",
            cypher: DEPENDENCY_COUNT_CYPHER,
            parameters: &["limit"],
            description: "Services ranked by inbound dependency count",
        },
        QueryTemplate {
            name: "service_neighbors",
            cypher: SERVICE_NEIGHBORS_CYPHER,
            parameters: &["name"],
            description: "All direct neighbors of a service",
        },
        QueryTemplate {
            name: "topic_consumers",
            cypher: TOPIC_CONSUMERS_CYPHER,
            parameters: &["topic_name"],
            description: "Services consuming from a Kafka topic",
        },
    ]
});

static INTENT_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)blast\s*radius|downstream.*fail|impact.*fail|fail.*impact").unwrap(),
            "blast_radius",
        ),
        (
            Regex::new(r"(?i)dependency\s*count|most\s*critical|most\s*depended|ranked\s*by.*dep")
                .unwrap(),
            "dependency_count",
        ),
        (
            Regex::new(r"(?i)(?:what|who)\s+does\s+\S+\s+call|neighbors?\s+of|connected\s+to|calls?\s+from")
                .unwrap(),
            "service_neighbors",
        ),
        (
            Regex::new(r"(?i)consum(?:e|es|ers?|ing)\s+(?:from|the)|subscribers?\s+(?:of|to|for)")
                .unwrap(),
            "topic_consumers",
        ),
    ]
});

static SERVICE_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:of|if|for|from|does|about)\s+(?:the\s+)?([a-zA-Z][\w-]*(?:-[a-zA-Z][\w-]*)*)(?:\s+(?:service|svc))?",
    )
    .unwrap()
});

static TOPIC_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:from|to|on|the)\s+(?:the\s+)?([a-zA-Z][\w-]*(?:-[a-zA-Z][\w-]*)*)(?:\s*(?:topic|queue))?",
    )
    .unwrap()
});

/// Immutable template catalog.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog;

impl TemplateCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn get(&self, name: &str) -> Option<&'static QueryTemplate> {
        TEMPLATES.iter().find(|t| t.name == name)
    }

    pub fn all_templates(&self) -> &'static [QueryTemplate] {
        &TEMPLATES
    }
}

fn extract_service_name(query: &str) -> Option<String> {
    SERVICE_NAME_PATTERN
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn extract_topic_name(query: &str) -> Option<String> {
    TOPIC_NAME_PATTERN
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Match a natural-language question against the catalog.
pub fn match_template(query: &str) -> Option<TemplateMatch> {
    let intent = INTENT_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(query))
        .map(|(_, intent)| *intent)?;

    let template = TemplateCatalog::new().get(intent)?;

    let mut params = HashMap::new();
    if template.parameters.contains(&"name") {
        if let Some(name) = extract_service_name(query) {
            params.insert("name".to_string(), name);
        }
    }
    if template.parameters.contains(&"topic_name") {
        if let Some(topic) = extract_topic_name(query) {
            params.insert("topic_name".to_string(), topic);
        }
    }
    if template.parameters.contains(&"limit") {
        params.insert("limit".to_string(), "10".to_string());
    }

    Some(TemplateMatch {
        template_name: intent.to_string(),
        params,
    })
}
