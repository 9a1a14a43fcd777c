use aws_config::BehaviorVersion;
use aws_smithy_runtime::client::http::test_util::{ReplayEvent, StaticReplayClient};
use aws_smithy_types::body::SdkBody;
use iot_telemetry_relay::dead_letter::{DeadLetter, DeadLetterSink, S3DeadLetterSink, SqsDeadLetterSink};
use iot_telemetry_relay::error::RelayState;

const QUEUE_URL: &str = "https://sqs.eu-central-1.amazonaws.com/123456789012/relay-dlq";

fn replay(status: u16, body: &str) -> ReplayEvent {
    ReplayEvent::new(
        http::Request::builder().body(SdkBody::from("")).unwrap(),
        http::Response::builder()
            .status(status)
            .body(SdkBody::from(body.to_string()))
            .unwrap(),
    )
}

fn get_mock_sqsclient(replay_client: StaticReplayClient) -> aws_sdk_sqs::Client {
    let conf = aws_sdk_sqs::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .credentials_provider(aws_sdk_sqs::config::Credentials::new(
            "SOMETESTKEYID",
            "somesecretkey",
            Some("somesessiontoken".to_string()),
            None,
            "",
        ))
        .region(aws_sdk_sqs::config::Region::new("eu-central-1"))
        .http_client(replay_client)
        .build();
    aws_sdk_sqs::Client::from_conf(conf)
}

fn get_mock_s3client(replay_client: StaticReplayClient) -> aws_sdk_s3::Client {
    let conf = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            "SOMETESTKEYID",
            "somesecretkey",
            Some("somesessiontoken".to_string()),
            None,
            "",
        ))
        .region(aws_sdk_s3::config::Region::new("eu-central-1"))
        .http_client(replay_client)
        .build();
    aws_sdk_s3::Client::from_conf(conf)
}

fn letter(body: &str) -> DeadLetter {
    DeadLetter {
        state: RelayState::Provisioning,
        error: "relay failed in state Provisioning: provisioning service answered 401: Unauthorized"
            .to_string(),
        body: body.to_string(),
    }
}

#[tokio::test]
async fn test_sqs_sink_sends_event_with_attributes() {
    let replay_client = StaticReplayClient::new(vec![replay(
        200,
        r#"{"MD5OfMessageBody":"5d41402abc4b2a76b9719d911017c592","MessageId":"0d1b1f3c-2f56-4bd9-9f4d-6e0e0f2b7d1a"}"#,
    )]);
    let sink = SqsDeadLetterSink::new(get_mock_sqsclient(replay_client.clone()), QUEUE_URL.to_string());

    sink.store(&letter(r#"{"payload":{}}"#)).await.unwrap();

    let requests: Vec<_> = replay_client.actual_requests().collect();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8_lossy(requests[0].body().bytes().unwrap()).to_string();
    assert!(body.contains("relay-dlq"), "got: {}", body);
    assert!(body.contains("LastError"), "got: {}", body);
    assert!(body.contains("RelayState"), "got: {}", body);
    assert!(body.contains("Provisioning"), "got: {}", body);
}

#[tokio::test]
async fn test_sqs_sink_rejects_empty_events() {
    let replay_client = StaticReplayClient::new(vec![]);
    let sink = SqsDeadLetterSink::new(get_mock_sqsclient(replay_client.clone()), QUEUE_URL.to_string());

    let err = sink.store(&letter("")).await.unwrap_err();

    assert!(err.to_string().contains("empty message body"), "got: {}", err);
    assert_eq!(replay_client.actual_requests().count(), 0);
}

#[tokio::test]
async fn test_sqs_sink_reports_failures() {
    let replay_client = StaticReplayClient::new(vec![replay(
        400,
        r#"{"__type":"com.amazonaws.sqs#QueueDoesNotExist","message":"The specified queue does not exist."}"#,
    )]);
    let sink = SqsDeadLetterSink::new(get_mock_sqsclient(replay_client), QUEUE_URL.to_string());

    let err = sink.store(&letter(r#"{"payload":{}}"#)).await.unwrap_err();
    assert!(err.to_string().starts_with("dead-letter delivery failed"), "got: {}", err);
}

#[tokio::test]
async fn test_s3_sink_writes_failed_event_object() {
    let replay_client = StaticReplayClient::new(vec![replay(200, "")]);
    let sink = S3DeadLetterSink::new(
        get_mock_s3client(replay_client.clone()),
        "relay-failures".to_string(),
    );

    sink.store(&letter("hello")).await.unwrap();

    let requests: Vec<_> = replay_client.actual_requests().collect();
    assert_eq!(requests.len(), 1);
    let uri = requests[0].uri().to_string();
    assert!(uri.contains("relay-failures"), "got: {}", uri);
    assert!(uri.contains("iot-telemetry-relay/failed-events/"), "got: {}", uri);
    assert!(uri.contains("5d41402abc4b2a76b9719d911017c592.json"), "got: {}", uri);
}
