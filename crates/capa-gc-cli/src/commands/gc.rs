//! `capa-gc enable|disable|configure` - set GC annotations on a cluster.
//!
//! The annotations live on the cluster's infrastructure object, not on the
//! CAPI `Cluster`: the command reads the `Cluster`, follows
//! `spec.infrastructureRef` to the `AWSCluster` or `AWSManagedControlPlane`
//! and merge-patches that object.
//!
//! # Usage
//!
//! ```bash
//! capa-gc enable --cluster-name prod -n capi-system
//! capa-gc configure --cluster-name prod --gc-task load-balancer --gc-task target-group
//! capa-gc configure --cluster-name prod   # back to every kind
//! ```

use capa_gc::tasks::{self, GC_ENABLED_ANNOTATION, GC_TASKS_ANNOTATION};
use clap::Args;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersion;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::kube_client;
use crate::{Error, Result};

/// Infrastructure kinds that carry the GC annotations
const SUPPORTED_INFRA_KINDS: [&str; 2] = ["AWSCluster", "AWSManagedControlPlane"];

/// Target cluster
#[derive(Args, Debug, Clone)]
pub struct GcArgs {
    /// Name of the CAPI Cluster
    #[arg(long)]
    pub cluster_name: String,

    /// Namespace of the CAPI Cluster
    #[arg(short, long, default_value = "default")]
    pub namespace: String,
}

/// Target cluster plus the task kinds to enable
#[derive(Args, Debug, Clone)]
pub struct ConfigureArgs {
    #[command(flatten)]
    pub target: GcArgs,

    /// Resource kind to collect (repeatable); omit to collect every kind
    #[arg(long = "gc-task", value_delimiter = ',')]
    pub gc_tasks: Vec<String>,
}

/// Reference from a CAPI Cluster to its infrastructure object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfraRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl InfraRef {
    /// Read `spec.infrastructureRef` from a CAPI Cluster
    ///
    /// A reference without a namespace points into the Cluster's namespace.
    pub fn from_cluster(cluster: &DynamicObject, cluster_namespace: &str) -> Result<Self> {
        let name = cluster.metadata.name.as_deref().unwrap_or_default();
        let reference = cluster
            .data
            .get("spec")
            .and_then(|spec| spec.get("infrastructureRef"))
            .ok_or_else(|| {
                Error::validation(format!("cluster {} has no spec.infrastructureRef", name))
            })?;

        let field = |key: &str| -> Result<String> {
            reference
                .get(key)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::validation(format!(
                        "cluster {} infrastructureRef is missing {}",
                        name, key
                    ))
                })
        };

        let kind = field("kind")?;
        if !SUPPORTED_INFRA_KINDS.contains(&kind.as_str()) {
            return Err(Error::validation(format!(
                "cluster {} infrastructure kind {} is not supported, expected one of: {}",
                name,
                kind,
                SUPPORTED_INFRA_KINDS.join(", ")
            )));
        }

        let namespace = reference
            .get("namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(cluster_namespace)
            .to_string();

        Ok(Self {
            api_version: field("apiVersion")?,
            kind,
            name: field("name")?,
            namespace,
        })
    }

    /// API resource used to address the referenced object
    pub fn api_resource(&self) -> Result<ApiResource> {
        let gv: GroupVersion = self.api_version.parse().map_err(|e| {
            Error::validation(format!("invalid apiVersion {}: {}", self.api_version, e))
        })?;
        Ok(ApiResource::from_gvk(&gv.with_kind(&self.kind)))
    }
}

fn cluster_api_resource() -> ApiResource {
    ApiResource {
        group: "cluster.x-k8s.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: "Cluster".to_string(),
        plural: "clusters".to_string(),
    }
}

/// Merge patch switching GC on or off
pub fn enabled_patch(enabled: bool) -> Value {
    json!({
        "metadata": {
            "annotations": {
                GC_ENABLED_ANNOTATION: enabled.to_string(),
            }
        }
    })
}

/// Merge patch selecting the collected kinds
///
/// Every token must name a known kind. No tokens removes the annotation,
/// which re-enables every kind.
pub fn tasks_patch(gc_tasks: &[String]) -> Result<Value> {
    let value = if gc_tasks.is_empty() {
        Value::Null
    } else {
        let set = tasks::parse(Some(&gc_tasks.join(",")))?;
        Value::String(set.to_annotation())
    };

    Ok(json!({
        "metadata": {
            "annotations": {
                GC_TASKS_ANNOTATION: value,
            }
        }
    }))
}

/// Resolve the infrastructure object of a CAPI Cluster
async fn resolve_infra(client: &Client, args: &GcArgs) -> Result<(Api<DynamicObject>, InfraRef)> {
    let clusters: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &args.namespace, &cluster_api_resource());
    let cluster = clusters
        .get_opt(&args.cluster_name)
        .await?
        .ok_or_else(|| Error::ClusterNotFound {
            namespace: args.namespace.clone(),
            name: args.cluster_name.clone(),
        })?;

    let infra = InfraRef::from_cluster(&cluster, &args.namespace)?;
    let api: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &infra.namespace, &infra.api_resource()?);

    if api.get_opt(&infra.name).await?.is_none() {
        return Err(Error::InfrastructureNotFound {
            kind: infra.kind,
            namespace: infra.namespace,
            name: infra.name,
        });
    }

    debug!(
        cluster = %args.cluster_name,
        kind = %infra.kind,
        name = %infra.name,
        "resolved infrastructure object"
    );
    Ok((api, infra))
}

async fn apply(kubeconfig: Option<&str>, args: &GcArgs, patch: &Value) -> Result<InfraRef> {
    let client = kube_client(kubeconfig).await?;
    let (api, infra) = resolve_infra(&client, args).await?;
    api.patch(&infra.name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(infra)
}

/// Run the enable command.
pub async fn enable(kubeconfig: Option<&str>, args: GcArgs) -> Result<()> {
    let infra = apply(kubeconfig, &args, &enabled_patch(true)).await?;
    info!(cluster = %args.cluster_name, kind = %infra.kind, "external resource gc enabled");
    println!(
        "Enabled external resource GC for cluster '{}' ({} {}).",
        args.cluster_name, infra.kind, infra.name
    );
    Ok(())
}

/// Run the disable command.
pub async fn disable(kubeconfig: Option<&str>, args: GcArgs) -> Result<()> {
    let infra = apply(kubeconfig, &args, &enabled_patch(false)).await?;
    info!(cluster = %args.cluster_name, kind = %infra.kind, "external resource gc disabled");
    println!(
        "Disabled external resource GC for cluster '{}' ({} {}).",
        args.cluster_name, infra.kind, infra.name
    );
    Ok(())
}

/// Run the configure command.
pub async fn configure(kubeconfig: Option<&str>, args: ConfigureArgs) -> Result<()> {
    // Validate before touching the cluster.
    let patch = tasks_patch(&args.gc_tasks)?;
    let infra = apply(kubeconfig, &args.target, &patch).await?;

    let selected = match patch["metadata"]["annotations"][GC_TASKS_ANNOTATION].as_str() {
        Some(value) => value.to_string(),
        None => "all kinds".to_string(),
    };
    info!(
        cluster = %args.target.cluster_name,
        kind = %infra.kind,
        tasks = %selected,
        "external resource gc tasks configured"
    );
    println!(
        "Configured GC tasks for cluster '{}': {}.",
        args.target.cluster_name, selected
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn cluster(spec: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": { "name": "prod", "namespace": "capi" },
            "spec": spec,
        }))
        .unwrap()
    }

    #[rstest]
    #[case("AWSCluster", "infrastructure.cluster.x-k8s.io/v1beta2", "awsclusters")]
    #[case(
        "AWSManagedControlPlane",
        "controlplane.cluster.x-k8s.io/v1beta2",
        "awsmanagedcontrolplanes"
    )]
    fn follows_supported_infrastructure_refs(
        #[case] kind: &str,
        #[case] api_version: &str,
        #[case] plural: &str,
    ) {
        let obj = cluster(json!({
            "infrastructureRef": { "apiVersion": api_version, "kind": kind, "name": "prod-infra" }
        }));

        let infra = InfraRef::from_cluster(&obj, "capi").unwrap();
        assert_eq!(infra.kind, kind);
        assert_eq!(infra.name, "prod-infra");
        assert_eq!(infra.namespace, "capi");

        let ar = infra.api_resource().unwrap();
        assert_eq!(ar.api_version, api_version);
        assert_eq!(ar.plural, plural);
    }

    #[test]
    fn explicit_ref_namespace_wins() {
        let obj = cluster(json!({
            "infrastructureRef": {
                "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta2",
                "kind": "AWSCluster",
                "name": "prod",
                "namespace": "infra"
            }
        }));
        assert_eq!(InfraRef::from_cluster(&obj, "capi").unwrap().namespace, "infra");
    }

    #[test]
    fn missing_infrastructure_ref_is_an_error() {
        let obj = cluster(json!({ "paused": false }));
        let err = InfraRef::from_cluster(&obj, "capi").unwrap_err();
        assert!(err.to_string().contains("infrastructureRef"));
    }

    #[test]
    fn unsupported_infrastructure_kind_is_rejected() {
        let obj = cluster(json!({
            "infrastructureRef": {
                "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta1",
                "kind": "DockerCluster",
                "name": "prod"
            }
        }));
        assert!(matches!(
            InfraRef::from_cluster(&obj, "capi"),
            Err(Error::Validation { .. })
        ));
    }

    #[rstest]
    #[case(true, "true")]
    #[case(false, "false")]
    fn enabled_patch_sets_annotation(#[case] enabled: bool, #[case] expected: &str) {
        let patch = enabled_patch(enabled);
        assert_eq!(
            patch["metadata"]["annotations"][GC_ENABLED_ANNOTATION],
            expected
        );
    }

    #[test]
    fn tasks_patch_writes_validated_set() {
        let patch = tasks_patch(&["target-group".into(), "load-balancer".into()]).unwrap();
        assert_eq!(
            patch["metadata"]["annotations"][GC_TASKS_ANNOTATION],
            "load-balancer,target-group"
        );
    }

    #[test]
    fn tasks_patch_without_tasks_removes_annotation() {
        let patch = tasks_patch(&[]).unwrap();
        let annotations = patch["metadata"]["annotations"].as_object().unwrap();
        assert!(annotations.contains_key(GC_TASKS_ANNOTATION));
        assert!(annotations[GC_TASKS_ANNOTATION].is_null());
    }

    #[test]
    fn tasks_patch_rejects_unknown_task() {
        let err = tasks_patch(&["load-balancer".into(), "INVALID".into()]).unwrap_err();
        assert!(matches!(err, Error::Gc(capa_gc::Error::Validation { .. })));
        assert!(err.to_string().contains("INVALID"));
    }
}
