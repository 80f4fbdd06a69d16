use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt as _, Snafu};
use stackable_operator::{
    kube::{CustomResource, ResourceExt as _},
    schemars::{self, JsonSchema},
};
use strum::{Display, EnumString};

/// Label that Strimzi uses to tie resources to a `Kafka` cluster, required on every registry.
pub const KAFKA_CLUSTER_LABEL: &str = "strimzi.io/cluster";

/// A Confluent Schema Registry deployment backed by a Strimzi-managed Kafka cluster.
///
/// The registry authenticates against Kafka with the TLS client certificate of the
/// KafkaUser that shares its name, and trusts the cluster CA of the cluster named by the
/// `strimzi.io/cluster` label.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "roundtable.lsst.codes",
    version = "v1beta1",
    kind = "StrimziSchemaRegistry",
    plural = "strimzischemaregistries",
    shortname = "ssr",
    namespaced,
    status = "StrimziSchemaRegistryStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct StrimziSchemaRegistrySpec {
    /// API version of the Strimzi `Kafka` resource, such as `v1beta2`.
    #[serde(default = "StrimziSchemaRegistrySpec::default_strimzi_version")]
    pub strimzi_version: String,

    /// Name of the Kafka listener that the registry connects to.
    #[serde(default = "StrimziSchemaRegistrySpec::default_listener")]
    pub listener: String,

    /// Kafka security protocol: `SSL`, `PLAINTEXT`, `SASL_PLAINTEXT` or `SASL_SSL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_protocol: Option<String>,

    /// Default schema compatibility level, such as `forward` or `backward_transitive`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility_level: Option<String>,

    /// Kafka topic that the registry stores its schemas in.
    #[serde(default = "StrimziSchemaRegistrySpec::default_registry_topic")]
    pub registry_topic: String,

    #[serde(default = "StrimziSchemaRegistrySpec::default_registry_image")]
    pub registry_image: String,

    #[serde(default = "StrimziSchemaRegistrySpec::default_registry_image_tag")]
    pub registry_image_tag: String,

    #[serde(default = "StrimziSchemaRegistrySpec::default_replicas")]
    pub replicas: i32,

    /// Type of the Service exposing the registry: `ClusterIP`, `NodePort` or `LoadBalancer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
}

impl StrimziSchemaRegistrySpec {
    fn default_strimzi_version() -> String {
        "v1beta2".to_string()
    }

    fn default_listener() -> String {
        "tls".to_string()
    }

    fn default_registry_topic() -> String {
        "registry-schemas".to_string()
    }

    fn default_registry_image() -> String {
        "confluentinc/cp-schema-registry".to_string()
    }

    fn default_registry_image_tag() -> String {
        "8.0.0".to_string()
    }

    fn default_replicas() -> i32 {
        1
    }
}

#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum SecurityProtocol {
    #[default]
    #[strum(serialize = "SSL")]
    Ssl,
    #[strum(serialize = "PLAINTEXT")]
    Plaintext,
    #[strum(serialize = "SASL_PLAINTEXT")]
    SaslPlaintext,
    #[strum(serialize = "SASL_SSL")]
    SaslSsl,
}

#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CompatibilityLevel {
    None,
    Backward,
    BackwardTransitive,
    #[default]
    Forward,
    ForwardTransitive,
    Full,
    FullTransitive,
}

#[derive(Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

/// CPU and memory settings of the registry container, each only present when configured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceSettings {
    pub cpu_limit: Option<String>,
    pub cpu_request: Option<String>,
    pub memory_limit: Option<String>,
    pub memory_request: Option<String>,
}

/// A [`StrimziSchemaRegistry`] whose spec has been checked and resolved against its defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    pub name: String,
    pub namespace: String,
    pub cluster: String,
    pub strimzi_version: String,
    pub listener: String,
    pub security_protocol: SecurityProtocol,
    pub compatibility_level: CompatibilityLevel,
    pub registry_topic: String,
    pub image: String,
    pub replicas: i32,
    pub service_type: ServiceType,
    pub resources: ResourceSettings,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum SpecError {
    #[snafu(display("object has no namespace"))]
    NoNamespace,

    #[snafu(display("object is missing the required {KAFKA_CLUSTER_LABEL:?} label"))]
    NoClusterLabel,

    #[snafu(display("invalid securityProtocol {value:?}"))]
    InvalidSecurityProtocol { value: String },

    #[snafu(display("invalid compatibilityLevel {value:?}"))]
    InvalidCompatibilityLevel { value: String },

    #[snafu(display("invalid serviceType {value:?}"))]
    InvalidServiceType { value: String },

    #[snafu(display("replicas must not be negative, got {replicas}"))]
    NegativeReplicas { replicas: i32 },

    #[snafu(display("{field} must not be empty"))]
    EmptyField { field: &'static str },
}

/// Parses an optional enum field, falling back to its default when unset or blank.
fn parse_or_default<T: FromStr + Default>(
    value: Option<&str>,
    error: impl FnOnce(String) -> SpecError,
) -> Result<T, SpecError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(T::default()),
        Some(v) => v.parse().map_err(|_| error(v.to_string())),
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn require(field: &'static str, value: &str) -> Result<String, SpecError> {
    let value = value.trim();
    if value.is_empty() {
        EmptyFieldSnafu { field }.fail()
    } else {
        Ok(value.to_string())
    }
}

impl StrimziSchemaRegistry {
    /// The Kafka cluster named by the registry's `strimzi.io/cluster` label.
    pub fn kafka_cluster(&self) -> Option<&str> {
        self.labels()
            .get(KAFKA_CLUSTER_LABEL)
            .map(String::as_str)
            .filter(|cluster| !cluster.is_empty())
    }

    pub fn validate(&self) -> Result<RegistryConfig, SpecError> {
        let spec = &self.spec;
        if spec.replicas < 0 {
            return NegativeReplicasSnafu {
                replicas: spec.replicas,
            }
            .fail();
        }
        Ok(RegistryConfig {
            name: self.name_any(),
            namespace: self.namespace().context(NoNamespaceSnafu)?,
            cluster: self.kafka_cluster().context(NoClusterLabelSnafu)?.to_string(),
            strimzi_version: require("strimziVersion", &spec.strimzi_version)?,
            listener: require("listener", &spec.listener)?,
            security_protocol: parse_or_default(spec.security_protocol.as_deref(), |value| {
                SpecError::InvalidSecurityProtocol { value }
            })?,
            compatibility_level: parse_or_default(spec.compatibility_level.as_deref(), |value| {
                SpecError::InvalidCompatibilityLevel { value }
            })?,
            registry_topic: require("registryTopic", &spec.registry_topic)?,
            image: format!(
                "{}:{}",
                require("registryImage", &spec.registry_image)?,
                require("registryImageTag", &spec.registry_image_tag)?
            ),
            replicas: spec.replicas,
            service_type: parse_or_default(spec.service_type.as_deref(), |value| {
                SpecError::InvalidServiceType { value }
            })?,
            resources: ResourceSettings {
                cpu_limit: non_blank(&spec.cpu_limit),
                cpu_request: non_blank(&spec.cpu_request),
                memory_limit: non_blank(&spec.memory_limit),
                memory_request: non_blank(&spec.memory_request),
            },
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrimziSchemaRegistryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RegistryPhase>,

    /// Digest of the credentials that the managed objects were last built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_digest: Option<String>,

    /// Kafka bootstrap server that the registry is configured to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_server: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<RegistryCondition>,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, JsonSchema, PartialEq, Eq, Serialize)]
pub enum RegistryPhase {
    Provisioning,
    Steady,
    Rotating,
    Degraded,
    Deleting,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    /// RFC 3339 timestamp of the last change of `status`.
    #[serde(default)]
    pub last_transition_time: String,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Serialize,
)]
pub enum ConditionType {
    /// The managed Secret, Deployment and Service match the registry.
    Available,
    /// The Strimzi credentials exist and could be converted.
    CredentialsReady,
    /// The registry's spec was accepted.
    SpecValid,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, JsonSchema, PartialEq, Eq, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl StrimziSchemaRegistryStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&RegistryCondition> {
        self.conditions.iter().find(|cond| cond.type_ == type_)
    }
}

/// The labels every object managed for `config` carries.
pub fn managed_labels(config: &RegistryConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "strimzischemaregistry".to_string(),
        ),
        ("app.kubernetes.io/instance".to_string(), config.name.clone()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            crate::OPERATOR_NAME.to_string(),
        ),
        ("app.kubernetes.io/part-of".to_string(), config.name.clone()),
        (
            "roundtable.lsst.codes/kafka-cluster".to_string(),
            config.cluster.clone(),
        ),
    ])
}
