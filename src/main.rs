use std::sync::Arc;

use aws_config::BehaviorVersion;
use iot_telemetry_relay::config;
use iot_telemetry_relay::dead_letter::sinks_from_config;
use iot_telemetry_relay::device::hub::MqttHubConnector;
use iot_telemetry_relay::device::provisioning::MqttProvisioner;
use iot_telemetry_relay::events::Combined;
use iot_telemetry_relay::relay::Relay;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    iot_telemetry_relay::set_up_logging();

    info!(
        "Initializing {} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let aws_config = aws_config::load_defaults(BehaviorVersion::v2023_11_09()).await;
    let clients = iot_telemetry_relay::AwsClients::new(&aws_config);
    let mut config = config::Config::load_from_env()?;

    // if the device key provided is an ARN, get the key from Secrets Manager
    if config.symmetric_key_is_secret_arn() {
        let secret_id = config.symmetric_key.expose().to_string();
        config.symmetric_key = config::get_symmetric_key_from_secrets_manager(&aws_config, secret_id)
            .await
            .map_err(|e| e.to_string())?;
    }
    info!("{:?}", config);

    let provisioner = MqttProvisioner::new(
        config.provisioning_transport,
        config.mqtt_keep_alive,
        config.sas_token_ttl,
    );
    let connector = MqttHubConnector::new(config.hub_transport, config.mqtt_keep_alive);
    let relay = Relay::new(Arc::new(provisioner), Arc::new(connector))
        .with_dead_letters(sinks_from_config(&config, &clients));

    run(service_fn(|request: LambdaEvent<Combined>| {
        iot_telemetry_relay::function_handler(&relay, &config, request)
    }))
    .await
}
