//! The control loop that keeps the managed objects of every [`StrimziSchemaRegistry`] in sync.

use std::sync::Arc;

use const_format::concatcp;
use snafu::{ResultExt as _, Snafu};
use stackable_operator::{
    k8s_openapi::api::{
        apps::v1::Deployment,
        core::v1::{Secret, Service},
    },
    kube::{
        api::DynamicObject,
        core::{error_boundary, DeserializeGuard},
        discovery::ApiResource,
        runtime::{controller::Action, reflector::ObjectRef},
    },
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    backoff::Backoff,
    bootstrap::kafka_api_resource,
    credentials::{client_secret_name, cluster_ca_secret_name},
    crd::{RegistryPhase, SpecError, StrimziSchemaRegistry, StrimziSchemaRegistryStatus},
    format::well_known::generate_password,
    resources::managed_secret_name,
    utils::error_full_message,
    OperatorConfig, OPERATOR_NAME,
};

use self::{
    api::{ApiError, Cluster},
    plan::{Observed, PlanError, PlanErrorDiscriminants},
    status::Outcome,
};

pub mod api;
pub mod plan;
pub mod status;

pub const CONTROLLER_NAME: &str = "strimzischemaregistry";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(CONTROLLER_NAME, ".", OPERATOR_NAME);

pub type RegistryRef = ObjectRef<DeserializeGuard<StrimziSchemaRegistry>>;

pub struct Ctx {
    pub client: stackable_operator::client::Client,
    pub config: OperatorConfig,
    pub backoff: Backoff<RegistryRef>,
}

/// How an error is handled, and how it is surfaced to the owner of the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with exponential backoff.
    Transient,
    /// Reported as a condition, retried once the credentials change.
    Credential,
    /// Reported as a condition, retried once the registry changes.
    Spec,
    /// Logged, retried on the next resync.
    Invariant,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("StrimziSchemaRegistry object is invalid"))]
    InvalidRegistry {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("StrimziSchemaRegistry spec is invalid"))]
    InvalidSpec { source: SpecError },

    #[snafu(display("failed to read the state of the registry"))]
    GetObject { source: ApiError },

    #[snafu(display("failed to plan changes to the managed objects"))]
    Plan { source: PlanError },

    #[snafu(display("failed to apply a managed object"))]
    ApplyObject { source: ApiError },

    #[snafu(display("failed to update the registry status"))]
    UpdateStatus { source: ApiError },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidRegistry { .. } | Error::InvalidSpec { .. } => ErrorClass::Spec,
            Error::GetObject { .. } | Error::UpdateStatus { .. } => ErrorClass::Transient,
            Error::ApplyObject { source } if source.is_invalid() => ErrorClass::Spec,
            Error::ApplyObject { .. } => ErrorClass::Transient,
            Error::Plan { source } => match source {
                PlanError::CredentialsPending { .. } | PlanError::KafkaNotFound { .. } => {
                    ErrorClass::Transient
                }
                PlanError::ResolveBootstrap { source } if source.is_transient() => {
                    ErrorClass::Transient
                }
                PlanError::ResolveBootstrap { .. } => ErrorClass::Spec,
                PlanError::ConvertCredentials { .. } => ErrorClass::Credential,
                PlanError::BuildObject { .. } | PlanError::ForeignOwner { .. } => {
                    ErrorClass::Invariant
                }
            },
        }
    }

    /// The status change that lets the owner of the registry know about this error, if any.
    fn outcome(&self) -> Option<Outcome> {
        let message = error_full_message(self);
        match (self, self.class()) {
            (_, ErrorClass::Spec) => Some(Outcome::SpecInvalid { message }),
            (
                Error::Plan {
                    source: PlanError::ConvertCredentials { source },
                },
                _,
            ) => Some(Outcome::CredentialsInvalid {
                reason: if source.is_mismatch() {
                    "CredentialMismatch"
                } else {
                    "CredentialFormat"
                },
                message,
            }),
            (
                Error::Plan {
                    source: PlanError::KafkaNotFound { .. } | PlanError::ResolveBootstrap { .. },
                },
                _,
            ) => Some(Outcome::KafkaPending { message }),
            _ => None,
        }
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        match self {
            Error::Plan { source } => PlanErrorDiscriminants::from(source).into(),
            _ => ErrorDiscriminants::from(self).into(),
        }
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::InvalidRegistry { .. } => None,
            Error::InvalidSpec { .. } => None,
            Error::GetObject { source } => Some(source.object().clone()),
            Error::Plan {
                source: PlanError::ForeignOwner { object, .. },
            } => Some(object.clone()),
            Error::Plan {
                source: PlanError::CredentialsPending { source },
            } => Some(source.secret().clone().erase()),
            Error::Plan { .. } => None,
            Error::ApplyObject { source } => Some(source.object().clone()),
            Error::UpdateStatus { .. } => None,
        }
    }
}

/// Writes status updates of one reconcile pass, skipping those that would not change anything.
struct StatusWriter<'a> {
    cluster: &'a Cluster,
    registry: &'a StrimziSchemaRegistry,
    current: Option<StrimziSchemaRegistryStatus>,
    resource_version: Option<String>,
}

impl<'a> StatusWriter<'a> {
    fn new(cluster: &'a Cluster, registry: &'a StrimziSchemaRegistry) -> Self {
        Self {
            cluster,
            registry,
            current: registry.status.clone(),
            resource_version: registry.metadata.resource_version.clone(),
        }
    }

    async fn record(&mut self, outcome: Outcome) -> Result<(), ApiError> {
        let next = status::next_status(
            self.current.as_ref(),
            outcome,
            self.registry.metadata.generation,
            &status::now(),
        );
        if self.current.as_ref() == Some(&next) {
            return Ok(());
        }
        self.resource_version = self
            .cluster
            .patch_status(
                self.registry.metadata.name.as_deref().unwrap_or_default(),
                self.resource_version.as_deref(),
                &next,
            )
            .await?;
        self.current = Some(next);
        Ok(())
    }
}

/// The status to write for a registry that could not be decoded, or `None` if `raw` already
/// carries it.
///
/// Only the parts of the previous status that still decode are carried over.
fn invalid_registry_status(
    raw: &DynamicObject,
    message: String,
    now: &str,
) -> Option<StrimziSchemaRegistryStatus> {
    let previous = raw
        .data
        .get("status")
        .cloned()
        .and_then(|status| serde_json::from_value::<StrimziSchemaRegistryStatus>(status).ok());
    let next = status::next_status(
        previous.as_ref(),
        Outcome::SpecInvalid { message },
        raw.metadata.generation,
        now,
    );
    (previous.as_ref() != Some(&next)).then_some(next)
}

/// Reports a registry that could not be decoded through its `SpecValid` condition.
async fn record_invalid_registry(ctx: &Ctx, registry_ref: &RegistryRef, error: &Error) {
    let Some(namespace) = registry_ref.namespace.as_deref() else {
        return;
    };
    let cluster = Cluster::new(
        ctx.client.as_kube_client(),
        namespace,
        ctx.config.api_timeout,
    );
    let resource = ApiResource::erase::<StrimziSchemaRegistry>(&());
    let result = async {
        let Some(raw) = cluster.get_dynamic(&resource, &registry_ref.name).await? else {
            return Ok(());
        };
        if let Some(next) = invalid_registry_status(&raw, error_full_message(error), &status::now())
        {
            cluster
                .patch_status(
                    &registry_ref.name,
                    raw.metadata.resource_version.as_deref(),
                    &next,
                )
                .await?;
        }
        Ok::<_, ApiError>(())
    }
    .await;
    if let Err(err) = result {
        tracing::warn!(
            registry = %registry_ref,
            error = &err as &dyn std::error::Error,
            "failed to report invalid registry in status"
        );
    }
}

pub async fn reconcile(
    registry: Arc<DeserializeGuard<StrimziSchemaRegistry>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    let registry_ref = ObjectRef::from_obj(&*registry);
    let registry = match &registry.0 {
        Ok(registry) => registry,
        Err(invalid) => {
            let err = Error::InvalidRegistry {
                source: invalid.clone(),
            };
            record_invalid_registry(&ctx, &registry_ref, &err).await;
            return Err(err);
        }
    };

    if let Some(cluster) = registry.kafka_cluster() {
        if cluster != ctx.config.kafka_cluster {
            tracing::debug!(
                registry = %registry_ref,
                kafka.cluster = cluster,
                "registry belongs to another Kafka cluster, skipping"
            );
            return Ok(Action::await_change());
        }
    }
    let Some(namespace) = registry.metadata.namespace.as_deref() else {
        return Err(SpecError::NoNamespace).context(InvalidSpecSnafu);
    };
    let cluster = Cluster::new(
        ctx.client.as_kube_client(),
        namespace,
        ctx.config.api_timeout,
    );
    let mut status = StatusWriter::new(&cluster, registry);

    if registry.metadata.deletion_timestamp.is_some() {
        // Owner references take care of the managed objects
        ctx.backoff.reset(&registry_ref);
        if let Err(err) = status.record(Outcome::Deleting).await {
            tracing::debug!(
                registry = %registry_ref,
                error = &err as &dyn std::error::Error,
                "could not mark registry as deleting"
            );
        }
        return Ok(Action::await_change());
    }

    let result = reconcile_registry(registry, &registry_ref, &cluster, &ctx, &mut status).await;
    if let Err(err) = &result {
        if let Some(outcome) = err.outcome() {
            if let Err(status_err) = status.record(outcome).await {
                tracing::warn!(
                    registry = %registry_ref,
                    error = &status_err as &dyn std::error::Error,
                    "failed to report reconcile error in status"
                );
            }
        }
    }
    result
}

async fn reconcile_registry(
    registry: &StrimziSchemaRegistry,
    registry_ref: &RegistryRef,
    cluster: &Cluster,
    ctx: &Ctx,
    status: &mut StatusWriter<'_>,
) -> Result<Action> {
    let config = registry.validate().context(InvalidSpecSnafu)?;

    let kafka_resource = kafka_api_resource(&config.strimzi_version);
    let (client_secret, ca_secret, kafka, managed_secret, deployment, service) = tokio::try_join!(
        cluster.get_opt::<Secret>(&client_secret_name(&config.name)),
        cluster.get_opt::<Secret>(&cluster_ca_secret_name(&config.cluster)),
        cluster.get_dynamic(&kafka_resource, &config.cluster),
        cluster.get_opt::<Secret>(&managed_secret_name(&config.name)),
        cluster.get_opt::<Deployment>(&config.name),
        cluster.get_opt::<Service>(&config.name),
    )
    .context(GetObjectSnafu)?;
    let observed = Observed {
        client_secret,
        ca_secret,
        kafka,
        managed_secret,
        deployment,
        service,
    };

    let plan = match plan::plan(registry, &config, &observed, generate_password) {
        Ok(plan) => plan,
        Err(PlanError::CredentialsPending { source }) => {
            let delay = ctx.backoff.next_delay(registry_ref.clone());
            tracing::info!(
                registry = %registry_ref,
                secret = %source.secret(),
                retry_in = ?delay,
                "credentials have not been issued yet"
            );
            status
                .record(Outcome::CredentialsPending {
                    message: source.to_string(),
                })
                .await
                .context(UpdateStatusSnafu)?;
            return Ok(Action::requeue(delay));
        }
        Err(source) => return Err(Error::Plan { source }),
    };

    for object in &plan.adopted {
        tracing::warn!(
            registry = %registry_ref,
            %object,
            "managed object has no owner, adopting it"
        );
    }

    if !plan.writes.is_empty() {
        tracing::info!(
            registry = %config.name,
            namespace = %config.namespace,
            digest = %plan.digest,
            phase = %plan.phase,
            writes = plan.writes.len(),
            "applying managed objects"
        );
        if plan.phase != RegistryPhase::Steady {
            status
                .record(Outcome::Applying { phase: plan.phase })
                .await
                .context(UpdateStatusSnafu)?;
        }
        for write in &plan.writes {
            cluster.apply(write).await.context(ApplyObjectSnafu)?;
            tracing::debug!(object = %write.object_ref(), "applied managed object");
        }
    }

    status
        .record(Outcome::Reconciled {
            digest: plan.digest.to_string(),
            bootstrap_server: plan.bootstrap_server,
        })
        .await
        .context(UpdateStatusSnafu)?;
    ctx.backoff.reset(registry_ref);
    Ok(Action::await_change())
}

pub fn error_policy(
    registry: Arc<DeserializeGuard<StrimziSchemaRegistry>>,
    error: &Error,
    ctx: Arc<Ctx>,
) -> Action {
    match error.class() {
        ErrorClass::Transient => {
            Action::requeue(ctx.backoff.next_delay(ObjectRef::from_obj(&*registry)))
        }
        ErrorClass::Credential | ErrorClass::Spec => Action::await_change(),
        ErrorClass::Invariant => Action::requeue(ctx.config.resync_interval),
    }
}
