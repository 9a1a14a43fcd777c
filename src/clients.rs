use aws_config::SdkConfig;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_sqs::Client as SqsClient;

/// A type used to hold the AWS clients required to interact with AWS services
/// used by the lambda function.
#[derive(Clone)]
pub struct AwsClients {
    pub s3: S3Client,
    pub sqs: SqsClient,
}

impl AwsClients {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        AwsClients {
            s3: S3Client::new(sdk_config),
            sqs: SqsClient::new(sdk_config),
        }
    }
}
