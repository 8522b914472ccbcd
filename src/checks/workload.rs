//! Built-in workload smoke checks
//!
//! Two cheap end-to-end probes of cloud-provider integration: can the
//! cluster provision and consume a volume, and can it expose a Service
//! through a cloud load balancer. Both create their workloads in a fresh
//! per-attempt namespace so a retry never trips over leftovers; the whole
//! cluster is torn down afterwards, so nothing is cleaned up here.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ExecAction, Namespace, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, Pod, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, PostParams};
use tracing::info;

use crate::checks::{Capability, Check, CheckContext};
use crate::error::Error;
use crate::wait::{poll, PollOutcome};

const STORAGE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const LB_POLL_INTERVAL: Duration = Duration::from_secs(3);

fn labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

async fn ensure_namespace(client: &kube::Client, name: &str) -> Result<(), Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        // A previous attempt may have left the namespace behind
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Provisions a StatefulSet with a volume claim and waits until its single
/// replica writes to the volume and reports ready. Proves dynamic volume
/// provisioning and attachment work end to end.
pub struct StorageCheck;

#[async_trait]
impl Check for StorageCheck {
    fn name(&self) -> String {
        "storage".to_string()
    }

    fn required_capability(&self) -> Capability {
        Capability::Storage
    }

    async fn run(&self, ctx: &CheckContext, attempt: u32) -> Result<(), Error> {
        let client = ctx.user.client()?;
        let namespace = format!("pvc-test-{attempt}");

        info!(namespace = %namespace, "Testing volume provisioning");
        ensure_namespace(client, &namespace).await?;

        let app_labels = labels("data-writer");
        let set = StatefulSet {
            metadata: ObjectMeta {
                name: Some("data-writer".to_string()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                selector: LabelSelector {
                    match_labels: Some(app_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(app_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "busybox".to_string(),
                            image: Some("registry.k8s.io/busybox".to_string()),
                            args: Some(vec![
                                "/bin/sh".to_string(),
                                "-c".to_string(),
                                "echo \"alive\" > /data/healthy; sleep 3600".to_string(),
                            ]),
                            readiness_probe: Some(Probe {
                                exec: Some(ExecAction {
                                    command: Some(vec![
                                        "cat".to_string(),
                                        "/data/healthy".to_string(),
                                    ]),
                                }),
                                period_seconds: Some(5),
                                success_threshold: Some(3),
                                timeout_seconds: Some(1),
                                failure_threshold: Some(1),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "data".to_string(),
                                mount_path: "/data".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some("data".to_string()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([(
                                "storage".to_string(),
                                Quantity("1Gi".to_string()),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let sets: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
        sets.create(&PostParams::default(), &set).await?;

        poll(
            "statefulset-ready",
            STORAGE_POLL_INTERVAL,
            ctx.timeout,
            &ctx.cancel,
            || {
                let sets = sets.clone();
                async move {
                    match sets.get("data-writer").await {
                        Ok(current) => {
                            let ready = current
                                .status
                                .as_ref()
                                .and_then(|s| s.ready_replicas)
                                .unwrap_or(0);
                            if ready >= 1 {
                                PollOutcome::Ready
                            } else {
                                PollOutcome::Pending(Error::CheckFailed {
                                    check: "storage".to_string(),
                                    message: "data-writer has no ready replica yet".to_string(),
                                })
                            }
                        }
                        Err(err) => PollOutcome::Pending(err.into()),
                    }
                }
            },
        )
        .await?;

        info!(namespace = %namespace, "Volume provisioning works");
        Ok(())
    }
}

/// Exposes a pod through a Service of type LoadBalancer and waits for the
/// cloud to hand out an external IP or hostname.
pub struct LoadBalancerCheck;

#[async_trait]
impl Check for LoadBalancerCheck {
    fn name(&self) -> String {
        "load-balancer".to_string()
    }

    fn required_capability(&self) -> Capability {
        Capability::LoadBalancers
    }

    async fn run(&self, ctx: &CheckContext, attempt: u32) -> Result<(), Error> {
        let client = ctx.user.client()?;
        let namespace = format!("lb-test-{attempt}");

        info!(namespace = %namespace, "Testing load balancer provisioning");
        ensure_namespace(client, &namespace).await?;

        let app_labels = labels("hello");
        let service = Service {
            metadata: ObjectMeta {
                name: Some("test".to_string()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                selector: Some(app_labels.clone()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    target_port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
        services.create(&PostParams::default(), &service).await?;

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("hello-kubernetes".to_string()),
                namespace: Some(namespace.clone()),
                labels: Some(app_labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "hello-kubernetes".to_string(),
                    image: Some("gcr.io/google-samples/node-hello:1.0".to_string()),
                    ports: Some(vec![ContainerPort {
                        name: Some("http".to_string()),
                        container_port: 8080,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        pods.create(&PostParams::default(), &pod).await?;

        poll(
            "loadbalancer-ingress",
            LB_POLL_INTERVAL,
            ctx.timeout,
            &ctx.cancel,
            || {
                let services = services.clone();
                async move {
                    match services.get("test").await {
                        Ok(current) => {
                            let has_ingress = current
                                .status
                                .as_ref()
                                .and_then(|s| s.load_balancer.as_ref())
                                .and_then(|lb| lb.ingress.as_ref())
                                .map(|ingress| {
                                    ingress.iter().any(|i| {
                                        i.ip.as_deref().is_some_and(|ip| !ip.is_empty())
                                            || i.hostname.as_deref().is_some_and(|h| !h.is_empty())
                                    })
                                })
                                .unwrap_or(false);
                            if has_ingress {
                                PollOutcome::Ready
                            } else {
                                PollOutcome::Pending(Error::CheckFailed {
                                    check: "load-balancer".to_string(),
                                    message: "service has no external IP or hostname yet".to_string(),
                                })
                            }
                        }
                        Err(err) => PollOutcome::Pending(err.into()),
                    }
                }
            },
        )
        .await?;

        info!(namespace = %namespace, "Load balancer provisioning works");
        Ok(())
    }
}
