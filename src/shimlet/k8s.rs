//! Kubernetes reference shimlet.
//!
//! Builds a `Deployment` so `replicaCount` has somewhere to live, and a
//! `Service` of type `NodePort` so `endPoint` can be reported once at
//! least one replica is Running (random port in `[30000, 32768)`,
//! `http://<nodeIP>:<port>`). Uses the same get-then-create-on-404
//! pattern and `Api::namespaced` usage throughout.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Node, PodSpec, PodTemplateSpec, ResourceRequirements as K8sResourceRequirements,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Api, Client};
use rand::Rng;

use crate::registry::Identified;
use crate::types::{RequirementSpec, RuntimeStatus, ServicePhase};

use super::{Result, Shimlet, ShimletError, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SERVICE_LABEL};

const NS: &str = "default";
const MODEL_NAME_ANNOTATION: &str = "modserv-shim/model-name";
const GOAL_SET_ANNOTATION: &str = "modserv-shim/goal-set-name";
const SHIMLET_ANNOTATION: &str = "modserv-shim/shimlet-name";
const CONTEXT_LENGTH_ANNOTATION: &str = "modserv-shim/context-length";
const NODE_PORT_RANGE: std::ops::Range<i32> = 30000..32768;

pub struct K8sShimlet {
    client: Mutex<Option<Client>>,
}

impl Default for K8sShimlet {
    fn default() -> Self {
        Self::new()
    }
}

impl K8sShimlet {
    pub fn new() -> Self {
        K8sShimlet {
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ShimletError::Adapter("k8s shimlet not initialized".into()))
    }

    fn deployment_name(service_id: &str) -> String {
        format!("modserv-{service_id}")
    }
}

fn common_labels(service_id: &str) -> BTreeMap<String, String> {
    [
        (SERVICE_LABEL.to_owned(), service_id.to_owned()),
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
    ]
    .into_iter()
    .collect()
}

fn build_deployment(spec: &RequirementSpec) -> Deployment {
    let name = K8sShimlet::deployment_name(&spec.service_id);
    let labels = common_labels(&spec.service_id);

    let mut annotations = BTreeMap::new();
    annotations.insert(MODEL_NAME_ANNOTATION.to_owned(), spec.model_name.clone());
    annotations.insert(GOAL_SET_ANNOTATION.to_owned(), spec.goal_set_name.clone());
    annotations.insert(SHIMLET_ANNOTATION.to_owned(), spec.shimlet_name.clone());
    annotations.insert(
        CONTEXT_LENGTH_ANNOTATION.to_owned(),
        spec.context_length.to_string(),
    );

    let mut env: Vec<EnvVar> = vec![
        EnvVar {
            name: "MODEL_PATH".into(),
            value: Some(spec.model_file_dir.clone()),
            ..EnvVar::default()
        },
        EnvVar {
            name: "CONTEXT_LENGTH".into(),
            value: Some(spec.context_length.to_string()),
            ..EnvVar::default()
        },
    ];
    env.extend(spec.env.iter().map(|e| EnvVar {
        name: e.key.clone(),
        value: Some(e.value.clone()),
        ..EnvVar::default()
    }));

    let resources = spec.resource_requirements.as_ref().map(|rr| {
        let mut limits = BTreeMap::new();
        limits.insert(
            rr.accelerator_type.clone(),
            k8s_openapi::apimachinery::pkg::api::resource::Quantity(rr.accelerator_count.to_string()),
        );
        K8sResourceRequirements {
            limits: Some(limits),
            ..K8sResourceRequirements::default()
        }
    });

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(NS.into()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replica_count as i32),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "model-server".into(),
                        image: Some(format!("model-server:{}", spec.model_name)),
                        env: Some(env),
                        resources,
                        ports: Some(vec![ContainerPort {
                            container_port: 8000,
                            ..ContainerPort::default()
                        }]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

fn build_service(spec: &RequirementSpec, node_port: i32) -> Service {
    let name = K8sShimlet::deployment_name(&spec.service_id);
    let labels = common_labels(&spec.service_id);
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(NS.into()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".into()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                port: 8000,
                target_port: Some(IntOrString::Int(8000)),
                node_port: Some(node_port),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

fn adapter_err(err: kube::Error) -> ShimletError {
    ShimletError::Adapter(err.to_string())
}

impl Identified for K8sShimlet {
    fn id(&self) -> &str {
        "k8s"
    }
}

#[async_trait]
impl Shimlet for K8sShimlet {
    async fn init_with_config(&self, _config_path: &str) -> Result<()> {
        // Idempotent: a second init on the same instance just re-derives
        // the client from the ambient kubeconfig/in-cluster config.
        let client = Client::try_default()
            .await
            .map_err(|e| ShimletError::Adapter(format!("failed to build k8s client: {e}")))?;
        *self.client.lock().unwrap() = Some(client);
        Ok(())
    }

    async fn apply(&self, spec: &RequirementSpec) -> Result<()> {
        if spec.model_file_dir.is_empty() {
            return Err(ShimletError::Validation(
                "model_file_dir must be resolved before apply".into(),
            ));
        }

        let client = self.client()?;
        let name = Self::deployment_name(&spec.service_id);
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), NS);
        let desired = build_deployment(spec);

        match deployments.get(&name).await {
            Ok(_) => {
                let patch = Patch::Merge(serde_json::json!({
                    "spec": desired.spec,
                    "metadata": { "annotations": desired.metadata.annotations },
                }));
                deployments
                    .patch(&name, &PatchParams::default(), &patch)
                    .await
                    .map_err(adapter_err)?;
            }
            Err(err) if is_not_found(&err) => {
                match deployments.create(&PostParams::default(), &desired).await {
                    Ok(_) => {}
                    Err(err) if is_conflict(&err) => {}
                    Err(err) => return Err(adapter_err(err)),
                }
            }
            Err(err) => return Err(adapter_err(err)),
        }

        let services: Api<Service> = Api::namespaced(client, NS);
        if let Err(err) = services.get(&name).await {
            if is_not_found(&err) {
                let node_port = rand::thread_rng().gen_range(NODE_PORT_RANGE);
                match services.create(&PostParams::default(), &build_service(spec, node_port)).await {
                    Ok(_) => {}
                    Err(err) if is_conflict(&err) => {}
                    Err(err) => return Err(adapter_err(err)),
                }
            } else {
                return Err(adapter_err(err));
            }
        }

        Ok(())
    }

    async fn delete(&self, service_id: &str) -> Result<()> {
        let client = self.client()?;
        let name = Self::deployment_name(service_id);
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), NS);
        if let Err(err) = deployments.delete(&name, &dp).await {
            if !is_not_found(&err) {
                return Err(adapter_err(err));
            }
        }

        let services: Api<Service> = Api::namespaced(client, NS);
        if let Err(err) = services.delete(&name, &dp).await {
            if !is_not_found(&err) {
                return Err(adapter_err(err));
            }
        }

        Ok(())
    }

    async fn status(&self, service_id: &str) -> Result<RuntimeStatus> {
        let client = self.client()?;
        let name = Self::deployment_name(service_id);
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), NS);

        let deployment = match deployments.get(&name).await {
            Ok(d) => d,
            Err(err) if is_not_found(&err) => return Ok(RuntimeStatus::unknown()),
            Err(err) => return Err(adapter_err(err)),
        };

        let deploy_spec = reconstruct_spec(&deployment);
        let ready_replicas = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let desired_replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);

        let services: Api<Service> = Api::namespaced(client, NS);
        let node_port = services
            .get_opt(&name)
            .await
            .map_err(adapter_err)?
            .and_then(|svc| svc.spec)
            .and_then(|s| s.ports)
            .and_then(|ports| ports.into_iter().next())
            .and_then(|p| p.node_port);

        let status = if ready_replicas > 0 && ready_replicas >= desired_replicas {
            ServicePhase::Running
        } else if desired_replicas > 0 {
            ServicePhase::Creating
        } else {
            ServicePhase::Pending
        };

        let end_point = match (status, node_port) {
            (ServicePhase::Running, Some(port)) => {
                let node_ip = first_node_ip(&self.client()?).await.unwrap_or_else(|| "0.0.0.0".into());
                format!("http://{node_ip}:{port}")
            }
            _ => String::new(),
        };

        Ok(RuntimeStatus {
            deploy_spec,
            status,
            end_point,
        })
    }

    async fn list_deployed(&self) -> Result<Vec<String>> {
        let client = self.client()?;
        let deployments: Api<Deployment> = Api::namespaced(client, NS);
        let lp = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"));
        let list = deployments.list(&lp).await.map_err(adapter_err)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|d| d.metadata.labels.and_then(|l| l.get(SERVICE_LABEL).cloned()))
            .collect())
    }
}

fn reconstruct_spec(deployment: &Deployment) -> Option<RequirementSpec> {
    let meta = &deployment.metadata;
    let labels = meta.labels.as_ref()?;
    let annotations = meta.annotations.clone().unwrap_or_default();
    let service_id = labels.get(SERVICE_LABEL)?.clone();
    let pod_spec = deployment.spec.as_ref()?.template.spec.as_ref()?;
    let container = pod_spec.containers.first()?;
    let env = container
        .env
        .as_ref()
        .map(|vars| {
            vars.iter()
                .filter(|v| v.name != "MODEL_PATH" && v.name != "CONTEXT_LENGTH")
                .map(|v| crate::types::Env {
                    key: v.name.clone(),
                    value: v.value.clone().unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(RequirementSpec {
        service_id,
        model_name: annotations.get(MODEL_NAME_ANNOTATION).cloned().unwrap_or_default(),
        model_file_dir: container
            .env
            .as_ref()
            .and_then(|vars| vars.iter().find(|v| v.name == "MODEL_PATH"))
            .and_then(|v| v.value.clone())
            .unwrap_or_default(),
        resource_requirements: None,
        replica_count: deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0) as u32,
        context_length: annotations
            .get(CONTEXT_LENGTH_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        env,
        goal_set_name: annotations.get(GOAL_SET_ANNOTATION).cloned().unwrap_or_default(),
        shimlet_name: annotations.get(SHIMLET_ANNOTATION).cloned().unwrap_or_default(),
    })
}

async fn first_node_ip(client: &Client) -> Option<String> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes.list(&ListParams::default().limit(1)).await.ok()?;
    let node = list.items.into_iter().next()?;
    node.status?
        .addresses?
        .into_iter()
        .find(|a| a.type_ == "InternalIP" || a.type_ == "ExternalIP")
        .map(|a| a.address)
}
