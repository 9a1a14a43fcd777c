//! Per-event relay: reshape, provision, send, close.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lambda_runtime::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FailurePolicy};
use crate::dead_letter::{DeadLetter, DynDeadLetterSink};
use crate::device::{self, DynHubConnector, DynProvisioner, SessionError, TelemetryMessage};
use crate::error::{RelayFailure, RelayState};
use crate::telemetry::{reshape, ReshapeOutcome};

/// Everything a relay needs besides configuration.
pub struct Relay {
    pub provisioner: DynProvisioner,
    pub connector: DynHubConnector,
    pub dead_letters: Vec<DynDeadLetterSink>,
}

/// A telemetry message that reached the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub outcome: ReshapeOutcome,
    pub bytes: usize,
}

fn enter(state: RelayState) {
    debug!(%state, "relay state");
}

impl Relay {
    pub fn new(provisioner: DynProvisioner, connector: DynHubConnector) -> Self {
        Relay {
            provisioner,
            connector,
            dead_letters: Vec::new(),
        }
    }

    pub fn with_dead_letters(mut self, sinks: Vec<DynDeadLetterSink>) -> Self {
        self.dead_letters = sinks;
        self
    }

    /// Relay one inbound body. The returned failure names the state the
    /// event was in when it failed.
    pub async fn relay_message(
        &self,
        config: &Config,
        raw: &str,
        cancel: &CancellationToken,
    ) -> Result<Delivery, RelayFailure> {
        enter(RelayState::Received);
        enter(RelayState::Transforming);
        let reshaped = reshape(raw, &config.reshape_options());

        if reshaped.outcome == ReshapeOutcome::Failed {
            enter(RelayState::TransformFailed);
            if !config.send_on_transform_failure {
                if let Some(err) = reshaped.error {
                    return Err(RelayFailure::new(RelayState::TransformFailed, err));
                }
            }
            warn!("sending an empty payload for a reading that could not be reshaped");
        } else {
            enter(RelayState::TransformOk);
        }

        enter(RelayState::Provisioning);
        let mut session = device::establish_session(
            self.provisioner.as_ref(),
            self.connector.as_ref(),
            &config.credentials(),
            config.sas_token_ttl,
            cancel,
        )
        .await
        .map_err(|e| match e {
            SessionError::Provisioning(source) => {
                RelayFailure::new(RelayState::Provisioning, source)
            }
            SessionError::Connecting(source) => {
                RelayFailure::new(RelayState::Authenticated, source)
            }
        })?;
        enter(RelayState::Authenticated);

        enter(RelayState::Sending);
        let bytes = reshaped.body.len();
        session
            .send(TelemetryMessage::json(reshaped.body), cancel)
            .await
            .map_err(|e| RelayFailure::new(RelayState::Sending, e))?;

        if let Err(e) = session.close().await {
            warn!("hub session did not close cleanly: {}", e);
        }
        enter(RelayState::Closed);
        info!("relayed {} bytes ({:?})", bytes, reshaped.outcome);

        Ok(Delivery {
            outcome: reshaped.outcome,
            bytes,
        })
    }

    /// Apply the configured failure policy to a failed event.
    pub async fn handle_failure(
        &self,
        config: &Config,
        raw: &str,
        failure: RelayFailure,
    ) -> Result<(), Error> {
        error!(state = %failure.state, "{}", failure);
        match config.failure_policy {
            FailurePolicy::Swallow => Ok(()),
            FailurePolicy::Propagate => Err(failure.into()),
            FailurePolicy::DeadLetter => {
                if self.dead_letters.is_empty() {
                    warn!("no dead-letter sink configured, dropping the event");
                    return Ok(());
                }
                let letter = DeadLetter {
                    state: failure.state,
                    error: failure.to_string(),
                    body: raw.to_string(),
                };
                // every sink gets the letter; one copy stored is enough
                let mut stored = 0;
                let mut last_error = None;
                for sink in &self.dead_letters {
                    match sink.store(&letter).await {
                        Ok(()) => stored += 1,
                        Err(e) => {
                            warn!("dead-letter sink failed: {}", e);
                            last_error = Some(e);
                        }
                    }
                }
                match last_error {
                    Some(e) if stored == 0 => Err(e.into()),
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Time left before the event should be abandoned, given the invocation
/// deadline in epoch milliseconds. `None` when there is no deadline.
pub fn invocation_budget(deadline_ms: u64, margin: Duration) -> Option<Duration> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    budget_at(deadline_ms, now, margin)
}

fn budget_at(deadline_ms: u64, now: Duration, margin: Duration) -> Option<Duration> {
    if deadline_ms == 0 {
        return None;
    }
    Some(
        Duration::from_millis(deadline_ms)
            .saturating_sub(now)
            .saturating_sub(margin),
    )
}

/// Cancel `cancel` once `budget` elapses. The caller aborts the returned
/// handle when the event finishes first.
pub fn spawn_watchdog(cancel: CancellationToken, budget: Option<Duration>) -> Option<JoinHandle<()>> {
    let budget = budget?;
    Some(tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(budget) => {
                warn!("invocation deadline is near, cancelling after {:?}", budget);
                cancel.cancel();
            }
        }
    }))
}
