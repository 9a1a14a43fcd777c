use lambda_runtime::{Error, LambdaEvent};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::BatchError;
use crate::events::Combined;
use crate::relay::Relay;

pub mod clients;
pub mod config;
pub mod dead_letter;
pub mod device;
pub mod error;
pub mod events;
pub mod relay;
pub mod telemetry;

pub use clients::AwsClients;

pub fn set_up_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();
}

// lambda handler
pub async fn function_handler(
    relay: &Relay,
    config: &Config,
    evt: LambdaEvent<Combined>,
) -> Result<(), Error> {
    info!("Handling lambda invocation");
    debug!("Handling event: {:?}", evt);

    let deadline = evt.context.deadline;
    let messages = evt.payload.into_messages();
    let total = messages.len();
    info!("relaying {} inbound messages", total);

    // every message is attempted, failures are reported together
    let mut errors = Vec::new();
    for message in messages {
        debug!("relaying message from {}", message.source);
        let cancel = CancellationToken::new();
        let watchdog = relay::spawn_watchdog(
            cancel.clone(),
            relay::invocation_budget(deadline, config.deadline_margin),
        );

        let result = relay.relay_message(config, &message.body, &cancel).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        if let Err(failure) = result {
            if let Err(e) = relay.handle_failure(config, &message.body, failure).await {
                error!("message from {} failed: {}", message.source, e);
                errors.push(e.to_string());
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(BatchError { total, errors }.into())
    }
}
