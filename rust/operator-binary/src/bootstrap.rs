//! Resolves the bootstrap server of a Kafka listener from the status of a Strimzi `Kafka`.

use serde::Deserialize;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::kube::{
    api::DynamicObject,
    core::GroupVersionKind,
    discovery::ApiResource,
};

pub const KAFKA_GROUP: &str = "kafka.strimzi.io";

#[derive(Debug, Snafu)]
pub enum BootstrapError {
    #[snafu(display("Kafka resource has an unexpected structure"))]
    ParseKafka { source: serde_json::Error },

    #[snafu(display("Kafka cluster has no listener named {listener:?}"))]
    UnknownListener { listener: String },

    #[snafu(display("Kafka cluster does not report listener {listener:?} in its status yet"))]
    ListenerNotReady { listener: String },

    #[snafu(display("Kafka listener {listener:?} has no address yet"))]
    NoAddress { listener: String },
}

impl BootstrapError {
    /// Whether the error goes away by itself once the Kafka operator catches up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BootstrapError::ListenerNotReady { .. } | BootstrapError::NoAddress { .. }
        )
    }
}

/// The API resource of Strimzi's `Kafka` kind in the given API version.
pub fn kafka_api_resource(strimzi_version: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(KAFKA_GROUP, strimzi_version, "Kafka"),
        "kafkas",
    )
}

#[derive(Debug, Default, Deserialize)]
struct Kafka {
    #[serde(default)]
    spec: KafkaSpec,
    #[serde(default)]
    status: KafkaStatus,
}

#[derive(Debug, Default, Deserialize)]
struct KafkaSpec {
    #[serde(default)]
    kafka: KafkaClusterSpec,
}

#[derive(Debug, Default, Deserialize)]
struct KafkaClusterSpec {
    #[serde(default)]
    listeners: ListenersSpec,
}

/// `v1beta2` declares listeners as a list, older versions used a map keyed by type.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListenersSpec {
    List(Vec<ListenerSpec>),
    Other(serde_json::Value),
}

impl Default for ListenersSpec {
    fn default() -> Self {
        ListenersSpec::List(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct ListenerSpec {
    name: String,
    #[serde(rename = "type")]
    type_: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KafkaStatus {
    #[serde(default)]
    listeners: Vec<ListenerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenerStatus {
    name: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    bootstrap_servers: Option<String>,
    #[serde(default)]
    addresses: Vec<ListenerAddress>,
}

#[derive(Debug, Deserialize)]
struct ListenerAddress {
    host: Option<String>,
    port: Option<u16>,
}

impl ListenerStatus {
    fn bootstrap_server(&self) -> Option<String> {
        if let Some(servers) = self.bootstrap_servers.as_ref().filter(|s| !s.is_empty()) {
            return Some(servers.clone());
        }
        let address = self.addresses.first()?;
        Some(format!("{}:{}", address.host.as_ref()?, address.port?))
    }
}

/// Looks up the bootstrap server address of `listener` in `kafka`.
///
/// With `v1beta1` the listener is identified by its type (`plain`, `tls` or `external`).
/// Later versions name their listeners, and the name must be declared in `spec.kafka.listeners`.
pub fn resolve_bootstrap_server(
    kafka: &DynamicObject,
    strimzi_version: &str,
    listener: &str,
) -> Result<String, BootstrapError> {
    let kafka: Kafka = serde_json::from_value(kafka.data.clone()).context(ParseKafkaSnafu)?;

    let listener_status = if strimzi_version == "v1beta1" {
        kafka
            .status
            .listeners
            .iter()
            .find(|status| status.type_.as_deref() == Some(listener))
    } else {
        let declared = match &kafka.spec.kafka.listeners {
            ListenersSpec::List(listeners) => listeners.iter().find(|l| l.name == listener),
            ListenersSpec::Other(_) => None,
        };
        let declared = declared.context(UnknownListenerSnafu { listener })?;
        tracing::debug!(
            listener,
            listener_type = declared.type_.as_deref(),
            "found listener in Kafka spec"
        );
        // Strimzi releases before 0.25 did not name listener statuses, only typed them
        kafka
            .status
            .listeners
            .iter()
            .find(|status| status.name.as_deref() == Some(listener))
            .or_else(|| {
                kafka.status.listeners.iter().find(|status| {
                    status.type_.as_deref() == Some(listener)
                        || (status.type_.is_some() && status.type_ == declared.type_)
                })
            })
    };

    listener_status
        .context(ListenerNotReadySnafu { listener })?
        .bootstrap_server()
        .context(NoAddressSnafu { listener })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kafka(yaml: &str) -> DynamicObject {
        serde_yaml::from_str(yaml).unwrap()
    }

    const KAFKA_V1BETA2: &str = r#"
        apiVersion: kafka.strimzi.io/v1beta2
        kind: Kafka
        metadata:
          name: events
          namespace: events
        spec:
          kafka:
            listeners:
              - name: plain
                port: 9092
                type: internal
                tls: false
              - name: tls
                port: 9093
                type: internal
                tls: true
              - name: external
                port: 9094
                type: loadbalancer
                tls: true
        status:
          listeners:
            - name: plain
              bootstrapServers: events-kafka-bootstrap.events.svc:9092
            - name: tls
              addresses:
                - host: events-kafka-bootstrap.events.svc
                  port: 9093
              bootstrapServers: events-kafka-bootstrap.events.svc:9093
            - name: external
              addresses:
                - host: 10.0.0.1
                  port: 9094
    "#;

    #[test]
    fn test_api_resource() {
        let ar = kafka_api_resource("v1beta2");
        assert_eq!(ar.group, "kafka.strimzi.io");
        assert_eq!(ar.version, "v1beta2");
        assert_eq!(ar.api_version, "kafka.strimzi.io/v1beta2");
        assert_eq!(ar.kind, "Kafka");
        assert_eq!(ar.plural, "kafkas");
    }

    #[test]
    fn test_v1beta2_by_name() {
        let kafka = kafka(KAFKA_V1BETA2);
        assert_eq!(
            resolve_bootstrap_server(&kafka, "v1beta2", "tls").unwrap(),
            "events-kafka-bootstrap.events.svc:9093"
        );
        assert_eq!(
            resolve_bootstrap_server(&kafka, "v1beta2", "external").unwrap(),
            "10.0.0.1:9094"
        );
    }

    #[test]
    fn test_v1beta2_unknown_listener() {
        let kafka = kafka(KAFKA_V1BETA2);
        let err = resolve_bootstrap_server(&kafka, "v1beta2", "sasl").unwrap_err();
        assert!(matches!(err, BootstrapError::UnknownListener { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_v1beta2_status_not_ready() {
        let kafka = kafka(
            r#"
            apiVersion: kafka.strimzi.io/v1beta2
            kind: Kafka
            metadata:
              name: events
            spec:
              kafka:
                listeners:
                  - name: tls
                    port: 9093
                    type: internal
                    tls: true
            "#,
        );
        let err = resolve_bootstrap_server(&kafka, "v1beta2", "tls").unwrap_err();
        assert!(matches!(err, BootstrapError::ListenerNotReady { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_v1beta2_falls_back_to_type() {
        let kafka = kafka(
            r#"
            apiVersion: kafka.strimzi.io/v1beta2
            kind: Kafka
            metadata:
              name: events
            spec:
              kafka:
                listeners:
                  - name: tls
                    port: 9093
                    type: internal
                    tls: true
            status:
              listeners:
                - type: tls
                  addresses:
                    - host: events-kafka-bootstrap.events.svc
                      port: 9093
            "#,
        );
        assert_eq!(
            resolve_bootstrap_server(&kafka, "v1beta2", "tls").unwrap(),
            "events-kafka-bootstrap.events.svc:9093"
        );
    }

    #[test]
    fn test_v1beta2_falls_back_to_declared_type() {
        let kafka = kafka(
            r#"
            apiVersion: kafka.strimzi.io/v1beta2
            kind: Kafka
            metadata:
              name: events
            spec:
              kafka:
                listeners:
                  - name: tls
                    port: 9093
                    type: internal
                    tls: true
            status:
              listeners:
                - type: internal
                  bootstrapServers: events-kafka-bootstrap.events.svc:9093
            "#,
        );
        assert_eq!(
            resolve_bootstrap_server(&kafka, "v1beta2", "tls").unwrap(),
            "events-kafka-bootstrap.events.svc:9093"
        );
    }

    #[test]
    fn test_v1beta1_by_type() {
        let kafka = kafka(
            r#"
            apiVersion: kafka.strimzi.io/v1beta1
            kind: Kafka
            metadata:
              name: events
            spec:
              kafka:
                listeners:
                  tls: {}
            status:
              listeners:
                - type: plain
                  addresses:
                    - host: events-kafka-bootstrap.events.svc
                      port: 9092
                - type: tls
                  addresses:
                    - host: events-kafka-bootstrap.events.svc
                      port: 9093
            "#,
        );
        assert_eq!(
            resolve_bootstrap_server(&kafka, "v1beta1", "tls").unwrap(),
            "events-kafka-bootstrap.events.svc:9093"
        );
        let err = resolve_bootstrap_server(&kafka, "v1beta1", "external").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_missing_address() {
        let kafka = kafka(
            r#"
            apiVersion: kafka.strimzi.io/v1beta2
            kind: Kafka
            metadata:
              name: events
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
                  addresses: []
            "#,
        );
        assert!(matches!(
            resolve_bootstrap_server(&kafka, "v1beta2", "tls"),
            Err(BootstrapError::NoAddress { .. })
        ));
    }
}
