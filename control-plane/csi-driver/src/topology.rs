//! Topology from domain labels.
//!
//! A node plugin started with `--domain-labels=<label>,<label>` reports the values of those
//! node labels as its topology segments, under `topology.<driver name>/<domain>`.
//! Storage classes may then set the `domainLabels` parameter to have new volumes report their
//! accessible topology from the CO's requirements.
use rpc::csi::{Topology, TopologyRequirement};
use snafu::{ensure, Snafu};
use std::collections::{BTreeMap, HashMap, HashSet};

/// CreateVolume parameter listing the topology keys a volume is constrained by.
pub const DOMAIN_LABELS_PARAM: &str = "domainLabels";
/// Kubernetes label prefixes are limited to 63 characters.
const LABEL_PREFIX_LIMIT: usize = 63;
const LABEL_SEPARATOR: char = ',';
const KEY_SEPARATOR: char = '/';

/// Topology errors.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display(
        "Computed topology label prefix '{}' for node exceeds length limits",
        prefix
    ))]
    PrefixTooLong { prefix: String },
    #[snafu(display("Duplicate label '{}' found in domain labels", label))]
    DuplicateLabel { label: String },
    #[snafu(display("Missing domain labels {:?} on node '{}'", labels, node))]
    MissingLabels { labels: Vec<String>, node: String },
}

/// Split a comma separated list of labels.
pub fn parse_domain_labels(domain_labels: &str) -> Vec<String> {
    domain_labels
        .split(LABEL_SEPARATOR)
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Topology of a new volume: the segments of the first preferred, or failing that requisite,
/// topologies which carry any of the storage class domain labels.
pub fn topology_from_params(
    parameters: &HashMap<String, String>,
    requirement: Option<&TopologyRequirement>,
) -> Option<HashMap<String, String>> {
    let labels = parse_domain_labels(parameters.get(DOMAIN_LABELS_PARAM)?);
    let requirement = requirement?;
    segments_for(&labels, &requirement.preferred)
        .or_else(|| segments_for(&labels, &requirement.requisite))
}

fn segments_for(labels: &[String], topologies: &[Topology]) -> Option<HashMap<String, String>> {
    let segments = topologies
        .iter()
        .flat_map(|topology| {
            labels.iter().filter_map(|label| {
                topology
                    .segments
                    .get(label)
                    .map(|domain| (label.clone(), domain.clone()))
            })
        })
        .collect::<HashMap<_, _>>();
    (!segments.is_empty()).then_some(segments)
}

/// Topology segments of this node, read from its labels.
pub fn node_topology(
    domain_labels: &str,
    driver_name: &str,
    node_name: &str,
    node_labels: &BTreeMap<String, String>,
) -> Result<HashMap<String, String>, Error> {
    let labels = parse_domain_labels(domain_labels);
    if labels.is_empty() {
        return Ok(HashMap::new());
    }

    let prefix = format!("topology.{driver_name}").to_lowercase();
    ensure!(
        prefix.len() <= LABEL_PREFIX_LIMIT,
        PrefixTooLong { prefix }
    );

    let mut wanted = HashSet::new();
    for label in &labels {
        ensure!(wanted.insert(label.as_str()), DuplicateLabel { label });
    }

    let mut topology = HashMap::new();
    for label in &labels {
        if let Some(value) = node_labels.get(label) {
            let domain = label
                .split_once(KEY_SEPARATOR)
                .map_or(label.as_str(), |(_, name)| name);
            topology.insert(format!("{prefix}/{domain}"), value.clone());
            wanted.remove(label.as_str());
        }
    }

    if !wanted.is_empty() {
        let mut labels = wanted.into_iter().map(String::from).collect::<Vec<_>>();
        labels.sort();
        return MissingLabels {
            labels,
            node: node_name,
        }
        .fail();
    }
    tracing::debug!(?topology, "Topology from domain labels");
    Ok(topology)
}
