use std::{fmt::Debug, sync::Arc, time::Duration};

use const_format::concatcp;
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::{
    client::GetApi,
    k8s_openapi::api::{
        apps::v1::StatefulSet,
        core::v1::{ConfigMap, Secret, Service},
        networking::v1::Ingress,
        policy::v1::PodDisruptionBudget,
    },
    kube::{
        api::{Api, DynamicObject, Patch, PartialObjectMeta, PatchParams},
        core::{error_boundary, DeserializeGuard},
        runtime::{
            controller,
            events::{Recorder, Reporter},
            reflector::ObjectRef,
            watcher, Controller,
        },
        Resource, ResourceExt,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
    namespace::WatchNamespace,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};

use crate::{
    crd::{Opensearch, OpensearchStatus},
    events::KubeEventPublisher,
    metrics::{Metrics, API_TLS_CONTROLLER, TRANSPORT_TLS_CONTROLLER},
    render::{self, naming, DerivedObjects},
    status::{cluster_url, RUNNING_PHASE},
    tls::{api, transport, KubeSecretStore, ReconcilerConfig, SecretChange, TlsContext},
    OPERATOR_NAME,
};

pub const CONTROLLER_NAME: &str = "opensearch";
const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);
/// Held by every cluster until its metrics are released.
pub const FINALIZER: &str = concatcp!(OPERATOR_NAME, "/finalizer");

pub async fn start(
    client: &stackable_operator::client::Client,
    watch_namespace: &WatchNamespace,
    config: ReconcilerConfig,
    metrics: Arc<Metrics>,
) {
    let event_recorder = Arc::new(Recorder::new(
        client.as_kube_client(),
        Reporter {
            controller: FULL_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    Controller::new(
        watch_namespace.get_api::<DeserializeGuard<Opensearch>>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<PartialObjectMeta<StatefulSet>>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<PartialObjectMeta<Service>>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<PartialObjectMeta<ConfigMap>>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<PartialObjectMeta<Secret>>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<PartialObjectMeta<PodDisruptionBudget>>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<PartialObjectMeta<Ingress>>(client),
        watcher::Config::default(),
    )
    .run(
        reconcile,
        error_policy,
        Arc::new(Ctx {
            client: client.clone(),
            events: KubeEventPublisher::new(client.as_kube_client(), FULL_CONTROLLER_NAME),
            metrics,
            config,
        }),
    )
    .for_each_concurrent(16, move |res| {
        let event_recorder = event_recorder.clone();
        async move {
            report_controller_reconciled(&event_recorder, FULL_CONTROLLER_NAME, &res).await
        }
    })
    .await;
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("Opensearch object is invalid"))]
    InvalidCluster {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("Opensearch object has no namespace"))]
    NoNamespace,

    #[snafu(display("failed to render cluster objects"))]
    Render { source: render::Error },

    #[snafu(display("failed to reconcile transport TLS"))]
    TransportTls { source: transport::Error },

    #[snafu(display("failed to reconcile API TLS"))]
    ApiTls { source: api::Error },

    #[snafu(display("failed to apply {object}"))]
    ApplyObject {
        source: stackable_operator::client::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to update status"))]
    ApplyStatus {
        source: stackable_operator::client::Error,
    },

    #[snafu(display("failed to update the finalizers of the Opensearch object"))]
    UpdateFinalizers {
        source: stackable_operator::kube::Error,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::ApplyObject { object, .. } => Some(object.clone()),
            _ => None,
        }
    }
}

impl Error {
    /// The step shown in `status.phase` while this error persists.
    pub fn phase(&self) -> &'static str {
        match self {
            Error::InvalidCluster { .. } | Error::NoNamespace | Error::Render { .. } => {
                "Render resources"
            }
            Error::TransportTls { .. } => "Generate transport TLS",
            Error::ApiTls { .. } => "Generate API TLS",
            Error::ApplyObject { .. } | Error::UpdateFinalizers { .. } => "Apply resources",
            Error::ApplyStatus { .. } => "Update status",
        }
    }
}

struct Ctx {
    client: stackable_operator::client::Client,
    events: KubeEventPublisher,
    metrics: Arc<Metrics>,
    config: ReconcilerConfig,
}

async fn reconcile(
    cluster: Arc<DeserializeGuard<Opensearch>>,
    ctx: Arc<Ctx>,
) -> Result<controller::Action> {
    if cluster.meta().deletion_timestamp.is_some() {
        return cleanup(&cluster, &ctx).await;
    }
    if !cluster.finalizers().iter().any(|finalizer| finalizer == FINALIZER) {
        let mut finalizers = cluster.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        patch_finalizers(&ctx, &cluster, finalizers).await?;
    }

    let cluster = cluster
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidClusterSnafu)?;

    let mut status = cluster.status.clone().unwrap_or_default();
    let result = reconcile_cluster(cluster, &ctx, &mut status).await;

    status.phase = match &result {
        Ok(_) => RUNNING_PHASE.to_string(),
        Err(error) => error.phase().to_string(),
    };
    status.url = cluster_url(cluster);
    status.credentials_ref = naming::credentials_secret_name(cluster);
    ctx.client
        .apply_patch_status(CONTROLLER_NAME, cluster, &status)
        .await
        .context(ApplyStatusSnafu)?;

    result
}

/// Renders and applies every object of the cluster. TLS conditions are recorded in
/// `status` even when a step fails.
async fn reconcile_cluster(
    cluster: &Opensearch,
    ctx: &Ctx,
    status: &mut OpensearchStatus,
) -> Result<controller::Action> {
    let namespace = cluster.namespace().context(NoNamespaceSnafu)?;
    let objects = render::render_cluster(cluster).context(RenderSnafu)?;

    let secrets = KubeSecretStore::new(ctx.client.as_kube_client(), &namespace);
    let tls = TlsContext {
        secrets: &secrets,
        events: &ctx.events,
        metrics: &ctx.metrics,
        config: &ctx.config,
    };
    let transport = transport::reconcile(&tls, cluster, &mut status.conditions)
        .await
        .context(TransportTlsSnafu)?;
    let api = api::reconcile(&tls, cluster, &mut status.conditions)
        .await
        .context(ApiTlsSnafu)?;

    apply_objects(&ctx.client, objects).await?;
    info!(
        cluster = %cluster.name_any(),
        ?transport,
        ?api,
        "cluster reconciled"
    );

    Ok(requeue_action([transport, api]))
}

/// Releases a deleted cluster. Owned objects are left to the garbage collector.
async fn cleanup(
    cluster: &DeserializeGuard<Opensearch>,
    ctx: &Ctx,
) -> Result<controller::Action> {
    if let Some(uid) = cluster.uid() {
        for controller in [TRANSPORT_TLS_CONTROLLER, API_TLS_CONTROLLER] {
            ctx.metrics.forget_resource(controller, &uid);
        }
    }
    if let Some(finalizers) = without_finalizer(cluster.finalizers()) {
        patch_finalizers(ctx, cluster, finalizers).await?;
    }
    info!(cluster = %cluster.name_any(), "cluster deleted");
    Ok(controller::Action::await_change())
}

/// The finalizers to keep once ours is released, `None` when ours is not held.
fn without_finalizer(finalizers: &[String]) -> Option<Vec<String>> {
    finalizers.iter().any(|finalizer| finalizer == FINALIZER).then(|| {
        finalizers
            .iter()
            .filter(|finalizer| *finalizer != FINALIZER)
            .cloned()
            .collect()
    })
}

/// Replaces the finalizer list, failing if the object changed since it was read.
async fn patch_finalizers(
    ctx: &Ctx,
    cluster: &DeserializeGuard<Opensearch>,
    finalizers: Vec<String>,
) -> Result<()> {
    let namespace = cluster.namespace().context(NoNamespaceSnafu)?;
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": cluster.resource_version(),
        }
    });
    Api::<DeserializeGuard<Opensearch>>::namespaced(ctx.client.as_kube_client(), &namespace)
        .patch(
            &cluster.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .context(UpdateFinalizersSnafu)?;
    Ok(())
}

fn requeue_action(changes: impl IntoIterator<Item = SecretChange>) -> controller::Action {
    changes
        .into_iter()
        .filter_map(SecretChange::requeue_after)
        .min()
        .map_or_else(controller::Action::await_change, controller::Action::requeue)
}

async fn apply_objects(
    client: &stackable_operator::client::Client,
    objects: DerivedObjects,
) -> Result<()> {
    let DerivedObjects {
        stateful_sets,
        services,
        load_balancer,
        config_maps,
        pod_disruption_budgets,
        ingress,
    } = objects;

    // Config maps first, so new pods find their configuration
    for config_map in &config_maps {
        apply(client, config_map).await?;
    }
    for service in services.iter().chain(&load_balancer) {
        apply(client, service).await?;
    }
    for stateful_set in &stateful_sets {
        apply(client, stateful_set).await?;
    }
    for pdb in &pod_disruption_budgets {
        apply(client, pdb).await?;
    }
    if let Some(ingress) = &ingress {
        apply(client, ingress).await?;
    }
    Ok(())
}

async fn apply<T>(client: &stackable_operator::client::Client, object: &T) -> Result<()>
where
    T: Clone + Debug + DeserializeOwned + Serialize + Resource<DynamicType = ()> + GetApi,
{
    debug!(object = %ObjectRef::from_obj(object), "applying");
    client
        .apply_patch(CONTROLLER_NAME, object, object)
        .await
        .with_context(|_| ApplyObjectSnafu {
            object: ObjectRef::from_obj(object).erase(),
        })?;
    Ok(())
}

fn error_policy(
    _obj: Arc<DeserializeGuard<Opensearch>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> controller::Action {
    match error {
        // Only a change to the cluster can fix these
        Error::InvalidCluster { .. } | Error::NoNamespace | Error::Render { .. } => {
            controller::Action::await_change()
        }
        _ => controller::Action::requeue(Duration::from_secs(5)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortest_requeue_wins() {
        assert_eq!(
            requeue_action([SecretChange::Created, SecretChange::Unchanged]),
            controller::Action::await_change()
        );
        assert_eq!(
            requeue_action([
                SecretChange::Requeue(Duration::from_secs(60)),
                SecretChange::Updated,
                SecretChange::Requeue(Duration::from_secs(30)),
            ]),
            controller::Action::requeue(Duration::from_secs(30))
        );
    }

    #[test]
    fn only_our_finalizer_is_released() {
        let other = "example.com/backup".to_string();
        assert_eq!(
            without_finalizer(&[other.clone(), FINALIZER.to_string()]),
            Some(vec![other.clone()])
        );
        assert_eq!(without_finalizer(&[other]), None);
        assert_eq!(FINALIZER, "opensearch.k8s.webcenter.fr/finalizer");
    }

    #[test]
    fn phases_name_the_failing_step() {
        assert_eq!(Error::NoNamespace.phase(), "Render resources");
        assert_eq!(
            Error::Render {
                source: render::Error::MissingIngressHost
            }
            .phase(),
            "Render resources"
        );
        assert_eq!(Error::NoNamespace.category(), "NoNamespace");
    }
}
