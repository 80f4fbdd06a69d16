//! Builds the Secret, Deployment and Service that run a Schema Registry.
//!
//! Everything in here is pure, the reconciler decides whether and when the built objects
//! get applied.

use std::collections::BTreeMap;

use snafu::{ResultExt as _, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::{
        api::{
            apps::v1::{Deployment, DeploymentSpec},
            core::v1::{
                Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec,
                PodTemplateSpec, ResourceRequirements, Secret, SecretKeySelector,
                SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
            },
        },
        apimachinery::pkg::{
            api::resource::Quantity, apis::meta::v1::LabelSelector, apis::meta::v1::ObjectMeta,
            util::intstr::IntOrString,
        },
    },
};

use crate::{
    credentials::{CredentialDigest, CREDENTIAL_DIGEST_ANNOTATION},
    crd::{managed_labels, RegistryConfig, ResourceSettings, StrimziSchemaRegistry},
    format::{
        well_known::{
            FILE_PKCS12_KEYSTORE, FILE_PKCS12_TRUSTSTORE, KEY_KEYSTORE_PASSWORD,
            KEY_TRUSTSTORE_PASSWORD, STORE_TYPE,
        },
        StorePasswords, TlsPkcs12,
    },
};

pub const CONTAINER_NAME: &str = "server";
pub const REGISTRY_PORT: i32 = 8081;
pub const REGISTRY_PORT_NAME: &str = "schema-registry";
pub const TLS_VOLUME_NAME: &str = "tls";
pub const TLS_MOUNT_PATH: &str = "/var/schemaregistry";
pub const SELECTOR_LABEL: &str = "app";
const HEAP_OPTS: &str = "-Xms512M -Xmx512M";

pub fn managed_secret_name(registry_name: &str) -> String {
    format!("{registry_name}-keystores")
}

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("failed to build owner reference to the registry"))]
    BuildOwnerReference {
        source: stackable_operator::builder::meta::Error,
    },
}

type Result<T, E = BuildError> = std::result::Result<T, E>;

fn object_meta(
    registry: &StrimziSchemaRegistry,
    config: &RegistryConfig,
    name: &str,
) -> Result<ObjectMeta> {
    let mut meta = ObjectMetaBuilder::new()
        .name_and_namespace(registry)
        .name(name)
        .ownerreference_from_resource(registry, None, Some(true))
        .context(BuildOwnerReferenceSnafu)?
        .build();
    meta.labels = Some(managed_labels(config));
    Ok(meta)
}

fn digest_annotations(digest: &CredentialDigest) -> BTreeMap<String, String> {
    BTreeMap::from([(
        CREDENTIAL_DIGEST_ANNOTATION.to_string(),
        digest.to_string(),
    )])
}

fn selector_labels(config: &RegistryConfig) -> BTreeMap<String, String> {
    BTreeMap::from([(SELECTOR_LABEL.to_string(), config.name.clone())])
}

/// Builds the Secret holding the keystore, the truststore and their passwords.
pub fn build_secret(
    registry: &StrimziSchemaRegistry,
    config: &RegistryConfig,
    stores: TlsPkcs12,
    passwords: &StorePasswords,
    digest: &CredentialDigest,
) -> Result<Secret> {
    let mut metadata = object_meta(registry, config, &managed_secret_name(&config.name))?;
    metadata.annotations = Some(digest_annotations(digest));
    Ok(Secret {
        metadata,
        type_: Some("Opaque".to_string()),
        data: Some(stores.into_secret_data(passwords)),
        ..Secret::default()
    })
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn env_var_from(name: &str, source: EnvVarSource) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(source),
    }
}

fn secret_key_ref(secret: &str, key: &str) -> EnvVarSource {
    EnvVarSource {
        secret_key_ref: Some(SecretKeySelector {
            name: secret.to_string(),
            key: key.to_string(),
            optional: None,
        }),
        ..EnvVarSource::default()
    }
}

/// The environment of the registry container, in the `SCHEMA_REGISTRY_*` form that the
/// Confluent image translates into `schema-registry.properties`.
pub fn registry_env(config: &RegistryConfig, bootstrap_server: &str) -> Vec<EnvVar> {
    let secret = managed_secret_name(&config.name);
    vec![
        env_var_from(
            "SCHEMA_REGISTRY_HOST_NAME",
            EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    // Matches what the API server defaults to, so the live object compares equal
                    api_version: Some("v1".to_string()),
                    field_path: "status.podIP".to_string(),
                }),
                ..EnvVarSource::default()
            },
        ),
        env_var(
            "SCHEMA_REGISTRY_LISTENERS",
            format!("http://0.0.0.0:{REGISTRY_PORT}"),
        ),
        env_var(
            "SCHEMA_REGISTRY_KAFKASTORE_BOOTSTRAP_SERVERS",
            bootstrap_server,
        ),
        env_var(
            "SCHEMA_REGISTRY_SCHEMA_COMPATIBILITY_LEVEL",
            config.compatibility_level.to_string(),
        ),
        env_var("SCHEMA_REGISTRY_LEADER_ELIGIBILITY", "true"),
        env_var("SCHEMA_REGISTRY_HEAP_OPTS", HEAP_OPTS),
        env_var(
            "SCHEMA_REGISTRY_KAFKASTORE_TOPIC",
            config.registry_topic.as_str(),
        ),
        env_var(
            "SCHEMA_REGISTRY_KAFKASTORE_SECURITY_PROTOCOL",
            config.security_protocol.to_string(),
        ),
        env_var(
            "SCHEMA_REGISTRY_KAFKASTORE_SSL_KEYSTORE_LOCATION",
            format!("{TLS_MOUNT_PATH}/{FILE_PKCS12_KEYSTORE}"),
        ),
        env_var("SCHEMA_REGISTRY_KAFKASTORE_SSL_KEYSTORE_TYPE", STORE_TYPE),
        env_var_from(
            "SCHEMA_REGISTRY_KAFKASTORE_SSL_KEYSTORE_PASSWORD",
            secret_key_ref(&secret, KEY_KEYSTORE_PASSWORD),
        ),
        env_var_from(
            "SCHEMA_REGISTRY_KAFKASTORE_SSL_KEY_PASSWORD",
            secret_key_ref(&secret, KEY_KEYSTORE_PASSWORD),
        ),
        env_var(
            "SCHEMA_REGISTRY_KAFKASTORE_SSL_TRUSTSTORE_LOCATION",
            format!("{TLS_MOUNT_PATH}/{FILE_PKCS12_TRUSTSTORE}"),
        ),
        env_var("SCHEMA_REGISTRY_KAFKASTORE_SSL_TRUSTSTORE_TYPE", STORE_TYPE),
        env_var_from(
            "SCHEMA_REGISTRY_KAFKASTORE_SSL_TRUSTSTORE_PASSWORD",
            secret_key_ref(&secret, KEY_TRUSTSTORE_PASSWORD),
        ),
    ]
}

/// Only configured quantities are rendered, an empty map would be rejected by the API server.
pub fn resource_requirements(settings: &ResourceSettings) -> Option<ResourceRequirements> {
    let quantities = |cpu: &Option<String>, memory: &Option<String>| {
        let map = [("cpu", cpu), ("memory", memory)]
            .into_iter()
            .filter_map(|(resource, value)| {
                value
                    .as_ref()
                    .map(|value| (resource.to_string(), Quantity(value.clone())))
            })
            .collect::<BTreeMap<_, _>>();
        (!map.is_empty()).then_some(map)
    };
    let limits = quantities(&settings.cpu_limit, &settings.memory_limit);
    let requests = quantities(&settings.cpu_request, &settings.memory_request);
    if limits.is_none() && requests.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        limits,
        requests,
        ..ResourceRequirements::default()
    })
}

/// Builds the Deployment running the registry.
///
/// The pod template carries the credential digest, so that a rotation changes the
/// template and Kubernetes rolls the pods onto the new keystores.
pub fn build_deployment(
    registry: &StrimziSchemaRegistry,
    config: &RegistryConfig,
    bootstrap_server: &str,
    digest: &CredentialDigest,
) -> Result<Deployment> {
    let metadata = object_meta(registry, config, &config.name)?;
    let mut pod_labels = managed_labels(config);
    pod_labels.extend(selector_labels(config));

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some(REGISTRY_PORT_NAME.to_string()),
            container_port: REGISTRY_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        env: Some(registry_env(config, bootstrap_server)),
        resources: resource_requirements(&config.resources),
        volume_mounts: Some(vec![VolumeMount {
            name: TLS_VOLUME_NAME.to_string(),
            mount_path: TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    };

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(config.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(config)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(digest_annotations(digest)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: TLS_VOLUME_NAME.to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(managed_secret_name(&config.name)),
                            ..SecretVolumeSource::default()
                        }),
                        ..Volume::default()
                    }]),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    })
}

/// Builds the Service in front of the registry.
///
/// Only the fields the operator cares about are set, so that values assigned by the API
/// server (such as the cluster IP) stay untouched.
pub fn build_service(registry: &StrimziSchemaRegistry, config: &RegistryConfig) -> Result<Service> {
    Ok(Service {
        metadata: object_meta(registry, config, &config.name)?,
        spec: Some(ServiceSpec {
            type_: Some(config.service_type.to_string()),
            selector: Some(selector_labels(config)),
            ports: Some(vec![ServicePort {
                name: Some(REGISTRY_PORT_NAME.to_string()),
                port: REGISTRY_PORT,
                target_port: Some(IntOrString::String(REGISTRY_PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    })
}
