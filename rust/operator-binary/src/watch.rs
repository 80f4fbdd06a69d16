//! Wires the reconciler to the change streams it depends on.

use std::sync::Arc;

use futures::StreamExt;
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::Deployment,
            core::v1::{Secret, Service},
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    },
    kube::{
        api::PartialObjectMeta,
        core::DeserializeGuard,
        runtime::{
            controller,
            events::{Recorder, Reporter},
            reflector::{self, ObjectRef},
            watcher, Controller,
        },
    },
    logging::controller::report_controller_reconciled,
};
use tokio_stream::wrappers::IntervalStream;

use crate::{
    backoff::Backoff,
    credentials::{client_secret_name, cluster_ca_secret_name},
    crd::{StrimziSchemaRegistry, KAFKA_CLUSTER_LABEL},
    reconciler::{self, Ctx, RegistryRef, FULL_CONTROLLER_NAME},
    OperatorConfig, OPERATOR_NAME,
};

/// Whether a change to the Secret described by `secret` can affect `registry`.
///
/// The Strimzi operators label both the client credential Secret and the cluster CA Secret
/// with the name of their Kafka cluster, which must match the cluster of the registry.
pub fn secret_affects_registry(registry: &StrimziSchemaRegistry, secret: &ObjectMeta) -> bool {
    let (Some(secret_name), Some(cluster)) = (
        secret.name.as_deref(),
        secret
            .labels
            .as_ref()
            .and_then(|labels| labels.get(KAFKA_CLUSTER_LABEL)),
    ) else {
        return false;
    };
    let (Some(registry_name), Some(registry_cluster)) =
        (registry.metadata.name.as_deref(), registry.kafka_cluster())
    else {
        return false;
    };
    secret.namespace == registry.metadata.namespace
        && cluster == registry_cluster
        && (secret_name == client_secret_name(registry_name)
            || secret_name == cluster_ca_secret_name(registry_cluster))
}

/// Resolves a change to a credential Secret into the registries that depend on it.
fn credential_watch_mapper(
    registries: reflector::Store<DeserializeGuard<StrimziSchemaRegistry>>,
) -> impl Fn(PartialObjectMeta<Secret>) -> Vec<RegistryRef> {
    move |secret| {
        registries
            .state()
            .into_iter()
            .filter(|registry| {
                registry
                    .0
                    .as_ref()
                    .is_ok_and(|registry| secret_affects_registry(registry, &secret.metadata))
            })
            .map(|registry| ObjectRef::from_obj(&*registry))
            .collect()
    }
}

/// Drops the retry state of registries that no longer exist.
fn prune_backoff(
    backoff: &Backoff<RegistryRef>,
    registries: &reflector::Store<DeserializeGuard<StrimziSchemaRegistry>>,
) {
    backoff.retain(|registry| registries.get(registry).is_some());
}

pub async fn start(client: &stackable_operator::client::Client, config: OperatorConfig) {
    let controller = Controller::new(
        config
            .watch_namespace
            .get_api::<DeserializeGuard<StrimziSchemaRegistry>>(client),
        watcher::Config::default(),
    );
    let registries = controller.store();
    let event_recorder = Arc::new(Recorder::new(
        client.as_kube_client(),
        Reporter {
            controller: FULL_CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    let managed = watcher::Config::default()
        .labels(&format!("app.kubernetes.io/managed-by={OPERATOR_NAME}"));
    let credentials =
        watcher::Config::default().labels(&format!("{KAFKA_CLUSTER_LABEL}={}", config.kafka_cluster));
    let resync = tokio::time::interval(config.resync_interval);
    let ctx = Arc::new(Ctx {
        client: client.clone(),
        config: config.clone(),
        backoff: Backoff::default(),
    });

    tracing::info!(
        kafka.cluster = %config.kafka_cluster,
        namespace = ?config.watch_namespace,
        resync_interval = ?config.resync_interval,
        "starting controller"
    );
    controller
        .owns(
            config
                .watch_namespace
                .get_api::<PartialObjectMeta<Secret>>(client),
            managed.clone(),
        )
        .owns(
            config
                .watch_namespace
                .get_api::<PartialObjectMeta<Deployment>>(client),
            managed.clone(),
        )
        .owns(
            config
                .watch_namespace
                .get_api::<PartialObjectMeta<Service>>(client),
            managed,
        )
        .watches(
            config
                .watch_namespace
                .get_api::<PartialObjectMeta<Secret>>(client),
            credentials,
            credential_watch_mapper(registries.clone()),
        )
        .reconcile_all_on(IntervalStream::new(resync).map({
            let ctx = ctx.clone();
            move |_| prune_backoff(&ctx.backoff, &registries)
        }))
        .with_config(controller::Config::default().concurrency(config.max_concurrent_reconciles))
        .shutdown_on_signal()
        .run(
            reconciler::reconcile,
            reconciler::error_policy,
            ctx,
        )
        .for_each_concurrent(16, move |res| {
            let event_recorder = event_recorder.clone();
            async move {
                report_controller_reconciled(&event_recorder, FULL_CONTROLLER_NAME, &res).await
            }
        })
        .await;
}
