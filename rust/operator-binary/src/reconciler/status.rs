//! Derives the status of a registry from the outcome of a reconcile.

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::crd::{
    ConditionStatus, ConditionType, RegistryCondition, RegistryPhase, StrimziSchemaRegistryStatus,
};

/// What a reconcile pass found out, as far as the status is concerned.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Writes for a first rollout or a rotation are about to be applied.
    Applying { phase: RegistryPhase },
    /// All managed objects match the registry.
    Reconciled {
        digest: String,
        bootstrap_server: String,
    },
    CredentialsPending { message: String },
    KafkaPending { message: String },
    CredentialsInvalid { reason: &'static str, message: String },
    SpecInvalid { message: String },
    Deleting,
}

pub fn now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn condition(
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> RegistryCondition {
    RegistryCondition {
        type_,
        status,
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: String::new(),
    }
}

fn credentials_ready() -> RegistryCondition {
    condition(
        ConditionType::CredentialsReady,
        ConditionStatus::True,
        "CredentialsConverted",
        "client and cluster CA certificates were converted into keystores",
    )
}

fn spec_valid() -> RegistryCondition {
    condition(
        ConditionType::SpecValid,
        ConditionStatus::True,
        "SpecAccepted",
        "the registry spec was accepted",
    )
}

/// The phase to report while waiting on something outside of our control.
fn waiting_phase(previous: Option<RegistryPhase>) -> RegistryPhase {
    match previous {
        Some(phase @ (RegistryPhase::Steady | RegistryPhase::Rotating)) => phase,
        _ => RegistryPhase::Provisioning,
    }
}

/// Computes the status that should follow `previous` after `outcome`.
///
/// Conditions that are not affected by `outcome` are carried over, and a condition only gets
/// a new `lastTransitionTime` (set to `now`) when its status flips. Feeding the same outcome
/// twice therefore yields the same status.
pub fn next_status(
    previous: Option<&StrimziSchemaRegistryStatus>,
    outcome: Outcome,
    observed_generation: Option<i64>,
    now: &str,
) -> StrimziSchemaRegistryStatus {
    let mut status = previous.cloned().unwrap_or_default();
    let previous_phase = status.phase;
    let updates = match outcome {
        Outcome::Applying { phase } => {
            status.phase = Some(phase);
            vec![
                condition(
                    ConditionType::Available,
                    ConditionStatus::False,
                    &phase.to_string(),
                    "applying managed objects",
                ),
                credentials_ready(),
                spec_valid(),
            ]
        }
        Outcome::Reconciled {
            digest,
            bootstrap_server,
        } => {
            status.phase = Some(RegistryPhase::Steady);
            status.credential_digest = Some(digest);
            status.bootstrap_server = Some(bootstrap_server);
            vec![
                condition(
                    ConditionType::Available,
                    ConditionStatus::True,
                    "Reconciled",
                    "managed Secret, Deployment and Service are up to date",
                ),
                credentials_ready(),
                spec_valid(),
            ]
        }
        Outcome::CredentialsPending { message } => {
            status.phase = Some(waiting_phase(previous_phase));
            vec![condition(
                ConditionType::CredentialsReady,
                ConditionStatus::False,
                "CredentialsPending",
                message,
            )]
        }
        Outcome::KafkaPending { message } => {
            status.phase = Some(waiting_phase(previous_phase));
            vec![condition(
                ConditionType::Available,
                ConditionStatus::False,
                "KafkaNotReady",
                message,
            )]
        }
        Outcome::CredentialsInvalid { reason, message } => {
            status.phase = Some(RegistryPhase::Degraded);
            vec![condition(
                ConditionType::CredentialsReady,
                ConditionStatus::False,
                reason,
                message,
            )]
        }
        Outcome::SpecInvalid { message } => {
            status.phase = Some(RegistryPhase::Degraded);
            vec![condition(
                ConditionType::SpecValid,
                ConditionStatus::False,
                "SpecInvalid",
                message,
            )]
        }
        Outcome::Deleting => {
            status.phase = Some(RegistryPhase::Deleting);
            Vec::new()
        }
    };

    for mut update in updates {
        match status
            .conditions
            .iter_mut()
            .find(|cond| cond.type_ == update.type_)
        {
            Some(existing) => {
                update.last_transition_time = if existing.status == update.status {
                    std::mem::take(&mut existing.last_transition_time)
                } else {
                    now.to_string()
                };
                *existing = update;
            }
            None => {
                update.last_transition_time = now.to_string();
                status.conditions.push(update);
            }
        }
    }
    status.conditions.sort_by_key(|cond| cond.type_);
    status.observed_generation = observed_generation.or(status.observed_generation);
    status
}
