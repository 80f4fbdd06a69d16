//! Decides which managed objects need to be written, given everything observed about a
//! registry. Nothing in here talks to the API server.

use std::collections::BTreeMap;

use snafu::{OptionExt as _, ResultExt as _, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::Deployment,
            core::v1::{Container, ResourceRequirements, Secret, Service},
        },
        apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
    },
    kube::{api::DynamicObject, runtime::reflector::ObjectRef, Resource},
};

use crate::{
    bootstrap::{self, BootstrapError},
    credentials::{
        client_secret_name, cluster_ca_secret_name, CredentialDigest, CredentialError,
        CredentialSource,
    },
    crd::{RegistryConfig, RegistryPhase, StrimziSchemaRegistry},
    format::{
        self,
        well_known::{FILE_PKCS12_KEYSTORE, FILE_PKCS12_TRUSTSTORE},
        StorePasswords, TlsToPkcs12Error,
    },
    resources::{self, BuildError, CONTAINER_NAME},
    utils::quantity_eq,
};

/// The live state of everything a registry depends on or manages.
#[derive(Clone, Debug, Default)]
pub struct Observed {
    pub client_secret: Option<Secret>,
    pub ca_secret: Option<Secret>,
    pub kafka: Option<DynamicObject>,
    pub managed_secret: Option<Secret>,
    pub deployment: Option<Deployment>,
    pub service: Option<Service>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    Secret(Secret),
    Deployment(Deployment),
    Service(Service),
}

impl Write {
    pub fn object_ref(&self) -> ObjectRef<DynamicObject> {
        match self {
            Write::Secret(obj) => ObjectRef::from_obj(obj).erase(),
            Write::Deployment(obj) => ObjectRef::from_obj(obj).erase(),
            Write::Service(obj) => ObjectRef::from_obj(obj).erase(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    /// [`RegistryPhase::Provisioning`] for a first rollout, [`RegistryPhase::Rotating`] while
    /// new credentials are rolled out, [`RegistryPhase::Steady`] otherwise.
    pub phase: RegistryPhase,
    pub digest: CredentialDigest,
    pub bootstrap_server: String,
    /// Writes in the order they must be applied, the Secret always goes first so that
    /// restarted pods find the new keystores.
    pub writes: Vec<Write>,
    /// Managed objects that had lost their owner reference and are re-adopted by `writes`.
    pub adopted: Vec<ObjectRef<DynamicObject>>,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum PlanError {
    #[snafu(display("credentials are not available yet"))]
    CredentialsPending { source: CredentialError },

    #[snafu(display("Kafka cluster {cluster:?} was not found"))]
    KafkaNotFound { cluster: String },

    #[snafu(display("failed to resolve the Kafka bootstrap server"))]
    ResolveBootstrap { source: BootstrapError },

    #[snafu(display("failed to convert credentials into keystores"))]
    ConvertCredentials { source: TlsToPkcs12Error },

    #[snafu(display("failed to build managed objects"))]
    BuildObject { source: BuildError },

    #[snafu(display("{object} is controlled by {owner}, refusing to take it over"))]
    ForeignOwner {
        object: ObjectRef<DynamicObject>,
        owner: String,
    },
}

enum Ownership {
    Owned,
    Orphaned,
}

/// Checks that a live managed object is controlled by `registry`.
fn ownership<K>(registry: &StrimziSchemaRegistry, live: &K) -> Result<Ownership, PlanError>
where
    K: Resource<DynamicType = ()>,
{
    let controller = live
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true));
    match controller {
        None => Ok(Ownership::Orphaned),
        Some(owner) if Some(&owner.uid) == registry.meta().uid.as_ref() => Ok(Ownership::Owned),
        Some(owner) => ForeignOwnerSnafu {
            object: ObjectRef::from_obj(live).erase(),
            owner: format!("{}/{} ({})", owner.kind, owner.name, owner.uid),
        }
        .fail(),
    }
}

/// Conditions a write on the version that was observed, turning concurrent edits into conflicts.
fn carry_resource_version(desired: &mut ObjectMeta, live: Option<&ObjectMeta>) {
    desired.resource_version = live.and_then(|live| live.resource_version.clone());
}

/// Works out the writes that bring the managed objects of `registry` in line with `observed`.
///
/// `new_password` is only called when no usable passwords are stored in the managed Secret yet.
pub fn plan(
    registry: &StrimziSchemaRegistry,
    config: &RegistryConfig,
    observed: &Observed,
    new_password: impl FnMut() -> String,
) -> Result<Plan, PlanError> {
    let secret_ref = |name: String| ObjectRef::<Secret>::new(&name).within(&config.namespace);
    let source = CredentialSource::from_secrets(
        observed
            .client_secret
            .as_ref()
            .ok_or_else(|| secret_ref(client_secret_name(&config.name))),
        observed
            .ca_secret
            .as_ref()
            .ok_or_else(|| secret_ref(cluster_ca_secret_name(&config.cluster))),
    )
    .context(CredentialsPendingSnafu)?;
    let digest = source.digest();

    let kafka = observed.kafka.as_ref().context(KafkaNotFoundSnafu {
        cluster: &config.cluster,
    })?;
    let bootstrap_server =
        bootstrap::resolve_bootstrap_server(kafka, &config.strimzi_version, &config.listener)
            .context(ResolveBootstrapSnafu)?;

    let mut writes = Vec::new();
    let mut adopted = Vec::new();
    let secret_orphaned = needs_adoption(registry, observed.managed_secret.as_ref(), &mut adopted)?;
    let deployment_orphaned = needs_adoption(registry, observed.deployment.as_ref(), &mut adopted)?;
    let service_orphaned = needs_adoption(registry, observed.service.as_ref(), &mut adopted)?;

    let live_digest = observed
        .managed_secret
        .as_ref()
        .and_then(|secret| CredentialDigest::from_annotations(secret.metadata.annotations.as_ref()));
    let phase = match (&observed.managed_secret, &live_digest) {
        (None, _) => RegistryPhase::Provisioning,
        (Some(_), Some(live)) if *live == digest => RegistryPhase::Steady,
        (Some(_), _) => RegistryPhase::Rotating,
    };

    let live_passwords = observed
        .managed_secret
        .as_ref()
        .and_then(StorePasswords::from_secret);
    let secret_complete = observed
        .managed_secret
        .as_ref()
        .is_some_and(has_stores)
        && live_passwords.is_some();
    if phase != RegistryPhase::Steady || !secret_complete || secret_orphaned {
        let passwords = live_passwords.unwrap_or_else(|| StorePasswords::generate(new_password));
        let stores = format::convert_tls_to_pkcs12(&source, &passwords)
            .context(ConvertCredentialsSnafu)?;
        let mut secret = resources::build_secret(registry, config, stores, &passwords, &digest)
            .context(BuildObjectSnafu)?;
        carry_resource_version(
            &mut secret.metadata,
            observed.managed_secret.as_ref().map(|s| &s.metadata),
        );
        writes.push(Write::Secret(secret));
    }

    let mut deployment = resources::build_deployment(registry, config, &bootstrap_server, &digest)
        .context(BuildObjectSnafu)?;
    let deployment_stale = match &observed.deployment {
        None => true,
        Some(live) => deployment_orphaned || deployment_differs(&deployment, live),
    };
    if deployment_stale {
        carry_resource_version(
            &mut deployment.metadata,
            observed.deployment.as_ref().map(|d| &d.metadata),
        );
        writes.push(Write::Deployment(deployment));
    }

    let mut service = resources::build_service(registry, config).context(BuildObjectSnafu)?;
    let service_stale = match &observed.service {
        None => true,
        Some(live) => service_orphaned || service_type(live) != service_type(&service),
    };
    if service_stale {
        carry_resource_version(
            &mut service.metadata,
            observed.service.as_ref().map(|s| &s.metadata),
        );
        writes.push(Write::Service(service));
    }

    Ok(Plan {
        phase,
        digest,
        bootstrap_server,
        writes,
        adopted,
    })
}

/// Whether `live` exists without a controller and has to be re-adopted.
fn needs_adoption<K>(
    registry: &StrimziSchemaRegistry,
    live: Option<&K>,
    adopted: &mut Vec<ObjectRef<DynamicObject>>,
) -> Result<bool, PlanError>
where
    K: Resource<DynamicType = ()>,
{
    match live.map(|live| ownership(registry, live)).transpose()? {
        Some(Ownership::Orphaned) => {
            if let Some(live) = live {
                adopted.push(ObjectRef::from_obj(live).erase());
            }
            Ok(true)
        }
        Some(Ownership::Owned) | None => Ok(false),
    }
}

fn has_stores(secret: &Secret) -> bool {
    secret.data.as_ref().is_some_and(|data| {
        [FILE_PKCS12_KEYSTORE, FILE_PKCS12_TRUSTSTORE]
            .iter()
            .all(|key| data.get(*key).is_some_and(|value| !value.0.is_empty()))
    })
}

fn service_type(service: &Service) -> &str {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        .unwrap_or("ClusterIP")
}

fn registry_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|container| container.name == CONTAINER_NAME)
}

fn template_digest(deployment: &Deployment) -> Option<CredentialDigest> {
    let template_meta = deployment.spec.as_ref()?.template.metadata.as_ref()?;
    CredentialDigest::from_annotations(template_meta.annotations.as_ref())
}

fn tls_secret_name(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .volumes
        .iter()
        .flatten()
        .find(|volume| volume.name == resources::TLS_VOLUME_NAME)?
        .secret
        .as_ref()?
        .secret_name
        .as_deref()
}

fn quantities_eq(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len()
        && a.iter().all(|(resource, qa)| {
            b.get(resource)
                .is_some_and(|qb| quantity_eq(resource, qa, qb))
        })
}

fn resources_eq(a: Option<&ResourceRequirements>, b: Option<&ResourceRequirements>) -> bool {
    quantities_eq(
        a.and_then(|r| r.limits.as_ref()),
        b.and_then(|r| r.limits.as_ref()),
    ) && quantities_eq(
        a.and_then(|r| r.requests.as_ref()),
        b.and_then(|r| r.requests.as_ref()),
    )
}

/// Compares the fields of the Deployment that the operator manages.
///
/// Fields that the API server or other controllers fill in are ignored, so they never
/// cause a write.
fn deployment_differs(desired: &Deployment, live: &Deployment) -> bool {
    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|spec| spec.replicas);
    if replicas(desired) != replicas(live)
        || template_digest(desired) != template_digest(live)
        || tls_secret_name(desired) != tls_secret_name(live)
    {
        return true;
    }
    match (registry_container(desired), registry_container(live)) {
        (Some(desired), Some(live)) => {
            desired.image != live.image
                || desired.env.as_deref().unwrap_or_default() != live.env.as_deref().unwrap_or_default()
                || !resources_eq(desired.resources.as_ref(), live.resources.as_ref())
        }
        _ => true,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use stackable_operator::k8s_openapi::{
        api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference, ByteString,
    };

    use super::*;
    use crate::{
        credentials::CREDENTIAL_DIGEST_ANNOTATION,
        format::test_certs::generate_credentials,
    };

    pub fn registry(spec: &str) -> StrimziSchemaRegistry {
        serde_yaml::from_str(&format!(
            "
            apiVersion: roundtable.lsst.codes/v1beta1
            kind: StrimziSchemaRegistry
            metadata:
              name: confluent-schema-registry
              namespace: events
              uid: 6a1c3b4e-0000-4000-8000-000000000001
              labels:
                strimzi.io/cluster: events
            spec:
              {spec}
            "
        ))
        .unwrap()
    }

    pub fn kafka() -> DynamicObject {
        serde_yaml::from_str(
            r#"
            apiVersion: kafka.strimzi.io/v1beta2
            kind: Kafka
            metadata:
              name: events
              namespace: events
            spec:
              kafka:
                listeners:
                  - name: tls
                    port: 9093
                    type: internal
                    tls: true
            status:
              listeners:
                - name: tls
                  bootstrapServers: events-kafka-bootstrap.events.svc:9093
            "#,
        )
        .unwrap()
    }

    fn secret(name: &str, entries: &[(&str, &[u8])]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("events".to_string()),
                resource_version: Some("1".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Secret::default()
        }
    }

    /// Credential Secrets as issued by Strimzi for `source`.
    pub fn credential_secrets(source: &CredentialSource) -> (Secret, Secret) {
        (
            secret(
                "confluent-schema-registry",
                &[
                    ("user.crt", source.client_cert_pem.as_slice()),
                    ("user.key", source.client_key_pem.as_slice()),
                ],
            ),
            secret("events-cluster-ca-cert", &[("ca.crt", source.ca_cert_pem.as_slice())]),
        )
    }

    pub fn counting_passwords() -> impl FnMut() -> String {
        let mut counter = 0;
        move || {
            counter += 1;
            format!("password{counter}")
        }
    }

    fn never_called() -> String {
        panic!("no new password should be generated")
    }

    /// Stores the plan's writes as the API server would, bumping resource versions.
    pub fn apply(observed: &mut Observed, plan: &Plan) {
        fn stored<K: Resource + Clone>(obj: &K) -> K {
            let mut obj = obj.clone();
            let version = obj
                .meta()
                .resource_version
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            obj.meta_mut().resource_version = Some((version + 1).to_string());
            obj
        }
        for write in &plan.writes {
            match write {
                Write::Secret(secret) => observed.managed_secret = Some(stored(secret)),
                Write::Deployment(deployment) => observed.deployment = Some(stored(deployment)),
                Write::Service(service) => {
                    let mut service = stored(service);
                    if let Some(spec) = service.spec.as_mut() {
                        spec.cluster_ip = Some("10.96.0.10".to_string());
                    }
                    observed.service = Some(service)
                }
            }
        }
    }

    fn observed_with(source: &CredentialSource) -> Observed {
        let (client_secret, ca_secret) = credential_secrets(source);
        Observed {
            client_secret: Some(client_secret),
            ca_secret: Some(ca_secret),
            kafka: Some(kafka()),
            ..Observed::default()
        }
    }

    fn deployment_digest(observed: &Observed) -> CredentialDigest {
        template_digest(observed.deployment.as_ref().unwrap()).unwrap()
    }

    fn secret_digest(observed: &Observed) -> CredentialDigest {
        CredentialDigest::from_annotations(
            observed
                .managed_secret
                .as_ref()
                .unwrap()
                .metadata
                .annotations
                .as_ref(),
        )
        .unwrap()
    }

    #[test]
    fn test_first_reconcile_provisions_everything() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let source = generate_credentials("confluent-schema-registry");
        let observed = observed_with(&source);

        let plan = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        assert_eq!(plan.phase, RegistryPhase::Provisioning);
        assert_eq!(plan.digest, source.digest());
        assert_eq!(plan.bootstrap_server, "events-kafka-bootstrap.events.svc:9093");
        assert!(matches!(
            plan.writes.as_slice(),
            [Write::Secret(_), Write::Deployment(_), Write::Service(_)]
        ));
        assert!(plan.adopted.is_empty());
        for write in &plan.writes {
            let object = write.object_ref();
            assert_eq!(object.namespace.as_deref(), Some("events"));
        }
    }

    #[test]
    fn test_second_reconcile_is_a_no_op() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let source = generate_credentials("confluent-schema-registry");
        let mut observed = observed_with(&source);

        let first = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);
        let second = plan(&registry, &config, &observed, never_called).unwrap();
        assert_eq!(second.phase, RegistryPhase::Steady);
        assert_eq!(second.writes, vec![]);
        assert_eq!(second.digest, first.digest);
    }

    #[test]
    fn test_rotation_regenerates_secret_and_rolls_deployment() {
        let registry = registry("{listener: tls, registryTopic: registry-schemas}");
        let config = registry.validate().unwrap();
        let v1 = generate_credentials("confluent-schema-registry");
        let mut observed = observed_with(&v1);

        let first = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);
        let d1 = secret_digest(&observed);
        assert_eq!(deployment_digest(&observed), d1);
        assert_eq!(
            observed.deployment.as_ref().unwrap().spec.as_ref().unwrap().replicas,
            Some(1)
        );
        let service_before = observed.service.clone();
        let passwords_before = StorePasswords::from_secret(observed.managed_secret.as_ref().unwrap());

        let v2 = generate_credentials("confluent-schema-registry");
        let (client_secret, ca_secret) = credential_secrets(&v2);
        observed.client_secret = Some(client_secret);
        observed.ca_secret = Some(ca_secret);

        let rotation = plan(&registry, &config, &observed, never_called).unwrap();
        assert_eq!(rotation.phase, RegistryPhase::Rotating);
        assert!(matches!(
            rotation.writes.as_slice(),
            [Write::Secret(_), Write::Deployment(_)]
        ));
        // Both writes are conditioned on what was observed
        for write in &rotation.writes {
            let version = match write {
                Write::Secret(s) => s.metadata.resource_version.clone(),
                Write::Deployment(d) => d.metadata.resource_version.clone(),
                Write::Service(s) => s.metadata.resource_version.clone(),
            };
            assert!(version.is_some());
        }
        apply(&mut observed, &rotation);

        let d2 = secret_digest(&observed);
        assert_ne!(d1, d2);
        assert_eq!(deployment_digest(&observed), d2);
        assert_eq!(observed.service, service_before);
        assert_eq!(
            StorePasswords::from_secret(observed.managed_secret.as_ref().unwrap()),
            passwords_before
        );

        let settled = plan(&registry, &config, &observed, never_called).unwrap();
        assert_eq!(settled.phase, RegistryPhase::Steady);
        assert!(settled.writes.is_empty());
    }

    #[test]
    fn test_missing_credentials_write_nothing() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let source = generate_credentials("confluent-schema-registry");
        let mut observed = observed_with(&source);
        let client_secret = observed.client_secret.take();

        let err = plan(&registry, &config, &observed, counting_passwords()).unwrap_err();
        match err {
            PlanError::CredentialsPending { source } => {
                assert_eq!(source.secret().name, "confluent-schema-registry");
            }
            other => panic!("unexpected error: {other}"),
        }

        observed.client_secret = client_secret;
        let plan = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        assert_eq!(plan.phase, RegistryPhase::Provisioning);
        assert_eq!(plan.writes.len(), 3);
    }

    #[test]
    fn test_missing_kafka_is_reported() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let mut observed = observed_with(&generate_credentials("confluent-schema-registry"));
        observed.kafka = None;
        assert!(matches!(
            plan(&registry, &config, &observed, counting_passwords()),
            Err(PlanError::KafkaNotFound { .. })
        ));
    }

    #[test]
    fn test_mismatched_credentials_write_nothing() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let source = generate_credentials("confluent-schema-registry");
        let other = generate_credentials("someone-else");
        let broken = CredentialSource {
            client_key_pem: other.client_key_pem,
            ..source
        };
        let observed = observed_with(&broken);
        match plan(&registry, &config, &observed, counting_passwords()) {
            Err(PlanError::ConvertCredentials { source }) => assert!(source.is_mismatch()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_spec_changes_only_touch_the_deployment() {
        let registry_v1 = registry("listener: tls");
        let config = registry_v1.validate().unwrap();
        let mut observed = observed_with(&generate_credentials("confluent-schema-registry"));
        let first = plan(&registry_v1, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);

        let registry_v2 = registry("{listener: tls, replicas: 2, cpuLimit: 500m}");
        let config = registry_v2.validate().unwrap();
        let plan = plan(&registry_v2, &config, &observed, never_called).unwrap();
        assert_eq!(plan.phase, RegistryPhase::Steady);
        assert!(matches!(plan.writes.as_slice(), [Write::Deployment(_)]));
    }

    #[test]
    fn test_service_type_change_rebuilds_service() {
        let registry_v1 = registry("listener: tls");
        let config = registry_v1.validate().unwrap();
        let mut observed = observed_with(&generate_credentials("confluent-schema-registry"));
        let first = plan(&registry_v1, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);

        let registry_v2 = registry("{listener: tls, serviceType: LoadBalancer}");
        let config = registry_v2.validate().unwrap();
        let plan = plan(&registry_v2, &config, &observed, never_called).unwrap();
        match plan.writes.as_slice() {
            [Write::Service(service)] => {
                let spec = service.spec.as_ref().unwrap();
                assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
                // The assigned cluster IP stays owned by the API server
                assert_eq!(spec.cluster_ip, None);
                assert!(service.metadata.resource_version.is_some());
            }
            other => panic!("unexpected writes: {other:?}"),
        }
    }

    #[test]
    fn test_canonicalised_quantities_are_not_rewritten() {
        let registry = registry("{listener: tls, cpuLimit: '0.5', memoryLimit: 1Gi}");
        let config = registry.validate().unwrap();
        let mut observed = observed_with(&generate_credentials("confluent-schema-registry"));
        let first = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);

        let limits = observed
            .deployment
            .as_mut()
            .and_then(|d| d.spec.as_mut())
            .and_then(|spec| spec.template.spec.as_mut())
            .and_then(|pod| pod.containers[0].resources.as_mut())
            .and_then(|resources| resources.limits.as_mut())
            .unwrap();
        limits.insert("cpu".to_string(), Quantity("500m".to_string()));
        limits.insert("memory".to_string(), Quantity("1024Mi".to_string()));

        let plan = plan(&registry, &config, &observed, never_called).unwrap();
        assert!(plan.writes.is_empty());
    }

    #[test]
    fn test_external_fields_are_ignored() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let mut observed = observed_with(&generate_credentials("confluent-schema-registry"));
        let first = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);

        let deployment = observed.deployment.as_mut().unwrap();
        let spec = deployment.spec.as_mut().unwrap();
        spec.revision_history_limit = Some(10);
        spec.template
            .metadata
            .as_mut()
            .unwrap()
            .annotations
            .as_mut()
            .unwrap()
            .insert(
                "kubectl.kubernetes.io/restartedAt".to_string(),
                "2024-01-01T00:00:00Z".to_string(),
            );
        assert!(plan(&registry, &config, &observed, never_called)
            .unwrap()
            .writes
            .is_empty());
    }

    #[test]
    fn test_orphaned_objects_are_adopted() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let mut observed = observed_with(&generate_credentials("confluent-schema-registry"));
        let first = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);

        observed.service.as_mut().unwrap().metadata.owner_references = None;
        let plan = plan(&registry, &config, &observed, never_called).unwrap();
        assert_eq!(plan.adopted.len(), 1);
        assert_eq!(plan.adopted[0].name, "confluent-schema-registry");
        match plan.writes.as_slice() {
            [Write::Service(service)] => {
                assert!(service.metadata.owner_references.is_some());
            }
            other => panic!("unexpected writes: {other:?}"),
        }
    }

    #[test]
    fn test_foreign_objects_are_left_alone() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let mut observed = observed_with(&generate_credentials("confluent-schema-registry"));
        let first = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);

        observed.deployment.as_mut().unwrap().metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: "something-else".to_string(),
            uid: "ffffffff-0000-4000-8000-000000000000".to_string(),
            controller: Some(true),
            ..OwnerReference::default()
        }]);
        assert!(matches!(
            plan(&registry, &config, &observed, never_called),
            Err(PlanError::ForeignOwner { .. })
        ));
    }

    #[test]
    fn test_damaged_secret_is_regenerated() {
        let registry = registry("listener: tls");
        let config = registry.validate().unwrap();
        let mut observed = observed_with(&generate_credentials("confluent-schema-registry"));
        let first = plan(&registry, &config, &observed, counting_passwords()).unwrap();
        apply(&mut observed, &first);

        let managed = observed.managed_secret.as_mut().unwrap();
        managed.data.as_mut().unwrap().remove("truststore.p12");
        let plan = plan(&registry, &config, &observed, never_called).unwrap();
        assert_eq!(plan.phase, RegistryPhase::Steady);
        match plan.writes.as_slice() {
            [Write::Secret(secret)] => {
                assert!(secret.data.as_ref().unwrap().contains_key("truststore.p12"));
                assert_eq!(
                    secret.metadata.annotations.as_ref().unwrap()[CREDENTIAL_DIGEST_ANNOTATION],
                    plan.digest.to_string()
                );
            }
            other => panic!("unexpected writes: {other:?}"),
        }
    }
}
