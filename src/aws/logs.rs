//! CloudWatch Logs sink for VPC flow logs

use crate::aws::{is_not_found, Error, TAG_KEY};
use aws_sdk_cloudwatchlogs::Client as LogsClient;
use tracing::debug;

/// Flow-log retention, in days
pub const FLOW_LOG_RETENTION_DAYS: i32 = 7;

fn sdk_err<E>(err: E) -> Error
where
    aws_sdk_cloudwatchlogs::Error: From<E>,
{
    Error::AwsLogs(Box::new(err.into()))
}

/// Name of the flow-log group for a VPC
pub fn flow_log_group_name(vpc_id: &str) -> String {
    format!("vpc-flow-logs/{vpc_id}")
}

/// Creates the flow-log group with one-week retention and returns its name
pub async fn create_flow_log_group(
    client: &LogsClient,
    vpc_id: &str,
    tag: &str,
) -> Result<String, Error> {
    let name = flow_log_group_name(vpc_id);
    client
        .create_log_group()
        .log_group_name(&name)
        .tags(TAG_KEY, tag)
        .send()
        .await
        .map_err(sdk_err)?;
    client
        .put_retention_policy()
        .log_group_name(&name)
        .retention_in_days(FLOW_LOG_RETENTION_DAYS)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(name)
}

/// Deletes the flow-log group, tolerating absence
pub async fn delete_flow_log_group(client: &LogsClient, vpc_id: &str) -> Result<(), Error> {
    let name = flow_log_group_name(vpc_id);
    match client
        .delete_log_group()
        .log_group_name(&name)
        .send()
        .await
    {
        Ok(_) => Ok(()),
        Err(err) => {
            let err = aws_sdk_cloudwatchlogs::Error::from(err);
            if is_not_found(&err) {
                debug!(group = name.as_str(), "log group already deleted");
                Ok(())
            } else {
                Err(Error::AwsLogs(Box::new(err)))
            }
        }
    }
}
