//! Node stage secret references.
//!
//! The CO resolves the node stage secret of a volume from its storage class parameters before
//! calling `NodeStageVolume`. Mounts re-established by the node plugin itself must perform the
//! same resolution, honouring the templates the external-provisioner supports:
//!
//! - `${pv.name}`
//! - `${pvc.namespace}`
//! - `${pvc.name}` (name only)
//! - `${pvc.annotations['ANNOTATION_KEY']}` (name only)
use lazy_static::lazy_static;
use regex::Regex;
use snafu::{ensure, Snafu};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

const CSI_PARAMETER_PREFIX: &str = "csi.storage.k8s.io/";

const TOKEN_PV_NAME: &str = "pv.name";
const TOKEN_PVC_NAME: &str = "pvc.name";
const TOKEN_PVC_NAMESPACE: &str = "pvc.namespace";

/// Storage class keys naming a secret.
#[derive(Debug, Clone, Copy)]
pub struct SecretParams {
    name: &'static str,
    deprecated_name_key: Option<&'static str>,
    deprecated_namespace_key: Option<&'static str>,
    name_key: &'static str,
    namespace_key: &'static str,
}

/// Fallback used for every kind of secret.
pub const DEFAULT_SECRET_PARAMS: SecretParams = SecretParams {
    name: "Default",
    deprecated_name_key: None,
    deprecated_namespace_key: None,
    name_key: "csi.storage.k8s.io/secret-name",
    namespace_key: "csi.storage.k8s.io/secret-namespace",
};

/// The node stage secret.
pub const NODE_STAGE_SECRET_PARAMS: SecretParams = SecretParams {
    name: "NodeStage",
    deprecated_name_key: Some("csiNodeStageSecretName"),
    deprecated_namespace_key: Some("csiNodeStageSecretNamespace"),
    name_key: "csi.storage.k8s.io/node-stage-secret-name",
    namespace_key: "csi.storage.k8s.io/node-stage-secret-namespace",
};

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"\$\{([^}]*)\}").expect("valid token regex");
    static ref DNS1123_LABEL: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid label regex");
    static ref DNS1123_SUBDOMAIN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
            .expect("valid subdomain regex");
}

/// Secret reference errors.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display(
        "{} secrets specified in parameters with both \"csi\" and \"{}\" keys",
        secret,
        CSI_PARAMETER_PREFIX
    ))]
    DoubleSpecified { secret: &'static str },
    #[snafu(display(
        "Either name or namespace for {} secrets specified, both must be specified",
        secret
    ))]
    Incomplete { secret: &'static str },
    #[snafu(display(
        "{} secrets specified in parameters but value of either namespace or name is empty",
        secret
    ))]
    EmptyTemplate { secret: &'static str },
    #[snafu(display("Error resolving value '{}': invalid tokens {:?}", template, tokens))]
    InvalidTokens {
        template: String,
        tokens: Vec<String>,
    },
    #[snafu(display("'{}' resolved to '{}' which is not a valid {}", template, value, kind))]
    InvalidName {
        template: String,
        value: String,
        kind: &'static str,
    },
}

/// A resolved secret reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

impl SecretRef {
    /// New reference to `namespace/name`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The claim a volume is bound to, as far as templates are concerned.
#[derive(Debug, Clone, Default)]
pub struct ClaimInfo {
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
}

/// Resolve the node stage secret reference of a volume from its storage class parameters.
/// None if the storage class names no secret at all.
pub fn node_stage_secret_ref(
    storage_class_params: &BTreeMap<String, String>,
    pv_name: &str,
    claim: Option<&ClaimInfo>,
) -> Result<Option<SecretRef>, Error> {
    secret_ref(NODE_STAGE_SECRET_PARAMS, storage_class_params, pv_name, claim)
}

/// Resolve the reference of the given secret, falling back to the default secret keys.
pub fn secret_ref(
    params: SecretParams,
    storage_class_params: &BTreeMap<String, String>,
    pv_name: &str,
    claim: Option<&ClaimInfo>,
) -> Result<Option<SecretRef>, Error> {
    let templates = match templates(params, storage_class_params)? {
        Some(templates) => Some(templates),
        None => templates(DEFAULT_SECRET_PARAMS, storage_class_params)?,
    };
    let Some((name_template, namespace_template)) = templates else {
        return Ok(None);
    };

    let mut namespace_params = HashMap::from([(TOKEN_PV_NAME.to_string(), pv_name.to_string())]);
    if let Some(claim) = claim {
        namespace_params.insert(TOKEN_PVC_NAMESPACE.to_string(), claim.namespace.clone());
    }
    let namespace = resolve_template(namespace_template, &namespace_params)?;
    ensure!(
        is_dns1123_label(&namespace),
        InvalidName {
            template: namespace_template,
            value: namespace,
            kind: "namespace name",
        }
    );

    let mut name_params = namespace_params;
    if let Some(claim) = claim {
        name_params.insert(TOKEN_PVC_NAME.to_string(), claim.name.clone());
        for (key, value) in &claim.annotations {
            name_params.insert(format!("pvc.annotations['{key}']"), value.clone());
        }
    }
    let name = resolve_template(name_template, &name_params)?;
    ensure!(
        is_dns1123_subdomain(&name),
        InvalidName {
            template: name_template,
            value: name,
            kind: "secret name",
        }
    );

    Ok(Some(SecretRef { name, namespace }))
}

/// Get the name and namespace templates and check they're specified correctly.
fn templates(
    params: SecretParams,
    storage_class_params: &BTreeMap<String, String>,
) -> Result<Option<(&str, &str)>, Error> {
    let lookup = |deprecated_key: Option<&str>, key: &str| {
        let deprecated =
            deprecated_key.and_then(|deprecated| storage_class_params.get_key_value(deprecated));
        if let Some((deprecated, _)) = deprecated {
            tracing::warn!(
                "\"{deprecated}\" is deprecated and will be removed in a future release, please use \"{key}\" instead"
            );
        }
        deprecated
            .into_iter()
            .chain(storage_class_params.get_key_value(key))
            .map(|(_, value)| value.as_str())
            .collect::<Vec<_>>()
    };
    let names = lookup(params.deprecated_name_key, params.name_key);
    let namespaces = lookup(params.deprecated_namespace_key, params.namespace_key);

    match (names.as_slice(), namespaces.as_slice()) {
        ([], []) => Ok(None),
        ([name], [namespace]) => {
            ensure!(
                !name.is_empty() && !namespace.is_empty(),
                EmptyTemplate {
                    secret: params.name
                }
            );
            Ok(Some((*name, *namespace)))
        }
        (names, namespaces) if names.len() > 1 || namespaces.len() > 1 => DoubleSpecified {
            secret: params.name,
        }
        .fail(),
        _ => Incomplete {
            secret: params.name,
        }
        .fail(),
    }
}

/// Expand every `${token}` of `template`, failing if any token has no value.
pub fn resolve_template(template: &str, params: &HashMap<String, String>) -> Result<String, Error> {
    let mut missing = BTreeSet::new();
    let resolved = TOKEN.replace_all(template, |captures: &regex::Captures| {
        let token = &captures[1];
        match params.get(token) {
            Some(value) => value.clone(),
            None => {
                missing.insert(token.to_string());
                String::new()
            }
        }
    });
    ensure!(
        missing.is_empty(),
        InvalidTokens {
            template,
            tokens: missing.into_iter().collect::<Vec<_>>(),
        }
    );
    Ok(resolved.into_owned())
}

fn is_dns1123_label(value: &str) -> bool {
    value.len() <= 63 && DNS1123_LABEL.is_match(value)
}

fn is_dns1123_subdomain(value: &str) -> bool {
    value.len() <= 253 && DNS1123_SUBDOMAIN.is_match(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn claim() -> ClaimInfo {
        ClaimInfo {
            name: "data".into(),
            namespace: "apps".into(),
            annotations: BTreeMap::from([(
                "fcfs.io/secret".to_string(),
                "fcfs-tenant".to_string(),
            )]),
        }
    }

    #[test]
    fn plain_reference() {
        let sc = params(&[
            (NODE_STAGE_SECRET_PARAMS.name_key, "fcfs-secret"),
            (NODE_STAGE_SECRET_PARAMS.namespace_key, "fastcfs"),
        ]);
        assert_eq!(
            node_stage_secret_ref(&sc, "pv-1", None).unwrap(),
            Some(SecretRef::new("fastcfs", "fcfs-secret"))
        );
    }

    #[test]
    fn templated_reference() {
        let sc = params(&[
            (
                NODE_STAGE_SECRET_PARAMS.name_key,
                "${pvc.annotations['fcfs.io/secret']}",
            ),
            (NODE_STAGE_SECRET_PARAMS.namespace_key, "${pvc.namespace}"),
        ]);
        assert_eq!(
            node_stage_secret_ref(&sc, "pv-1", Some(&claim())).unwrap(),
            Some(SecretRef::new("apps", "fcfs-tenant"))
        );

        let sc = params(&[
            (NODE_STAGE_SECRET_PARAMS.name_key, "${pvc.name}-${pv.name}"),
            (NODE_STAGE_SECRET_PARAMS.namespace_key, "fastcfs"),
        ]);
        assert_eq!(
            node_stage_secret_ref(&sc, "pv-1", Some(&claim())).unwrap(),
            Some(SecretRef::new("fastcfs", "data-pv-1"))
        );
    }

    #[test]
    fn default_and_deprecated_keys() {
        let sc = params(&[
            (DEFAULT_SECRET_PARAMS.name_key, "fallback"),
            (DEFAULT_SECRET_PARAMS.namespace_key, "fastcfs"),
        ]);
        assert_eq!(
            node_stage_secret_ref(&sc, "pv-1", None).unwrap(),
            Some(SecretRef::new("fastcfs", "fallback"))
        );

        let sc = params(&[
            ("csiNodeStageSecretName", "legacy"),
            ("csiNodeStageSecretNamespace", "fastcfs"),
        ]);
        assert_eq!(
            node_stage_secret_ref(&sc, "pv-1", None).unwrap(),
            Some(SecretRef::new("fastcfs", "legacy"))
        );

        assert_eq!(node_stage_secret_ref(&params(&[]), "pv-1", None), Ok(None));
    }

    #[test]
    fn invalid_references() {
        let sc = params(&[
            ("csiNodeStageSecretName", "legacy"),
            (NODE_STAGE_SECRET_PARAMS.name_key, "new"),
            (NODE_STAGE_SECRET_PARAMS.namespace_key, "fastcfs"),
        ]);
        assert!(matches!(
            node_stage_secret_ref(&sc, "pv-1", None),
            Err(Error::DoubleSpecified { .. })
        ));

        let sc = params(&[(NODE_STAGE_SECRET_PARAMS.name_key, "secret")]);
        assert!(matches!(
            node_stage_secret_ref(&sc, "pv-1", None),
            Err(Error::Incomplete { .. })
        ));

        let sc = params(&[
            (NODE_STAGE_SECRET_PARAMS.name_key, ""),
            (NODE_STAGE_SECRET_PARAMS.namespace_key, "fastcfs"),
        ]);
        assert!(matches!(
            node_stage_secret_ref(&sc, "pv-1", None),
            Err(Error::EmptyTemplate { .. })
        ));

        // the claim name is not available to namespaces
        let sc = params(&[
            (NODE_STAGE_SECRET_PARAMS.name_key, "secret"),
            (NODE_STAGE_SECRET_PARAMS.namespace_key, "${pvc.name}"),
        ]);
        assert!(matches!(
            node_stage_secret_ref(&sc, "pv-1", Some(&claim())),
            Err(Error::InvalidTokens { .. })
        ));

        let sc = params(&[
            (NODE_STAGE_SECRET_PARAMS.name_key, "Not_Valid"),
            (NODE_STAGE_SECRET_PARAMS.namespace_key, "fastcfs"),
        ]);
        assert!(matches!(
            node_stage_secret_ref(&sc, "pv-1", None),
            Err(Error::InvalidName { .. })
        ));
    }

    #[test]
    fn template_tokens() {
        let params = HashMap::from([("pv.name".to_string(), "pv-1".to_string())]);
        assert_eq!(resolve_template("no-tokens", &params).unwrap(), "no-tokens");
        assert_eq!(resolve_template("${pv.name}-x", &params).unwrap(), "pv-1-x");
        assert_eq!(
            resolve_template("${pvc.name}${foo}", &params),
            Err(Error::InvalidTokens {
                template: "${pvc.name}${foo}".into(),
                tokens: vec!["foo".into(), "pvc.name".into()],
            })
        );
    }
}
