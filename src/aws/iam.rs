//! IAM roles and instance profiles for the compute fleet and flow-log delivery

use crate::aws::{is_not_found, Error, TAG_KEY};
use aws_sdk_iam::{types::Tag, Client as IamClient};
use tracing::debug;

/// Managed policies attached to every fleet instance role: remote session
/// management and the CloudWatch metrics agent.
const INSTANCE_MANAGED_POLICIES: [&str; 2] = [
    "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore",
    "arn:aws:iam::aws:policy/CloudWatchAgentServerPolicy",
];

/// Name of the inline policy granting flow-log delivery permissions
const FLOW_LOG_POLICY_NAME: &str = "flow-log-delivery";

/// Trust policy allowing EC2 to assume the instance role
const EC2_ASSUME_ROLE_POLICY: &str = r#"{
    "Version": "2012-10-17",
    "Statement": [
        {
            "Effect": "Allow",
            "Principal": {
                "Service": "ec2.amazonaws.com"
            },
            "Action": "sts:AssumeRole"
        }
    ]
}"#;

/// Trust policy allowing the flow-logs service to assume the delivery role
const FLOW_LOGS_ASSUME_ROLE_POLICY: &str = r#"{
    "Version": "2012-10-17",
    "Statement": [
        {
            "Effect": "Allow",
            "Principal": {
                "Service": "vpc-flow-logs.amazonaws.com"
            },
            "Action": "sts:AssumeRole"
        }
    ]
}"#;

/// Inline policy granting log delivery into the flow-log group
fn flow_log_delivery_policy(log_group_name: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": "FlowLogDelivery",
                "Effect": "Allow",
                "Action": [
                    "logs:CreateLogStream",
                    "logs:PutLogEvents",
                    "logs:DescribeLogGroups",
                    "logs:DescribeLogStreams"
                ],
                "Resource": format!("arn:aws:logs:*:*:log-group:{log_group_name}*")
            }
        ]
    })
    .to_string()
}

fn sdk_err<E>(err: E) -> Error
where
    aws_sdk_iam::Error: From<E>,
{
    Error::AwsIam(Box::new(err.into()))
}

fn deployment_tag(tag: &str) -> Result<Tag, Error> {
    Ok(Tag::builder().key(TAG_KEY).value(tag).build()?)
}

/// Creates the fleet instance role with its managed policy grants and wraps
/// it in an instance profile of the same name. Returns the shared name.
pub async fn create_instance_role(
    client: &IamClient,
    short_name: &str,
    tag: &str,
) -> Result<String, Error> {
    let role_name = format!("{short_name}-instance-role");
    client
        .create_role()
        .role_name(&role_name)
        .assume_role_policy_document(EC2_ASSUME_ROLE_POLICY)
        .description(format!("Role for {short_name} servers"))
        .tags(deployment_tag(tag)?)
        .send()
        .await
        .map_err(sdk_err)?;
    for policy_arn in INSTANCE_MANAGED_POLICIES {
        client
            .attach_role_policy()
            .role_name(&role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_err)?;
    }
    client
        .create_instance_profile()
        .instance_profile_name(&role_name)
        .tags(deployment_tag(tag)?)
        .send()
        .await
        .map_err(sdk_err)?;
    client
        .add_role_to_instance_profile()
        .instance_profile_name(&role_name)
        .role_name(&role_name)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(role_name)
}

/// Creates the flow-log delivery role and returns its ARN
pub async fn create_flow_log_role(
    client: &IamClient,
    log_group_name: &str,
    tag: &str,
) -> Result<String, Error> {
    let role_name = format!("{tag}-flow-logs");
    let resp = client
        .create_role()
        .role_name(&role_name)
        .assume_role_policy_document(FLOW_LOGS_ASSUME_ROLE_POLICY)
        .description(format!("Flow-log delivery role for {tag}"))
        .tags(deployment_tag(tag)?)
        .send()
        .await
        .map_err(sdk_err)?;
    let role_arn = resp
        .role()
        .ok_or(Error::MissingResponse("role"))?
        .arn()
        .to_string();
    client
        .put_role_policy()
        .role_name(&role_name)
        .policy_name(FLOW_LOG_POLICY_NAME)
        .policy_document(flow_log_delivery_policy(log_group_name))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(role_arn)
}

/// Deletes the fleet instance role and profile, tolerating absence
pub async fn delete_instance_role(client: &IamClient, short_name: &str) -> Result<(), Error> {
    let role_name = format!("{short_name}-instance-role");
    tolerate_not_found(
        client
            .remove_role_from_instance_profile()
            .instance_profile_name(&role_name)
            .role_name(&role_name)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)
            .map(|_| ()),
        &role_name,
    )?;
    tolerate_not_found(
        client
            .delete_instance_profile()
            .instance_profile_name(&role_name)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)
            .map(|_| ()),
        &role_name,
    )?;
    for policy_arn in INSTANCE_MANAGED_POLICIES {
        tolerate_not_found(
            client
                .detach_role_policy()
                .role_name(&role_name)
                .policy_arn(policy_arn)
                .send()
                .await
                .map_err(aws_sdk_iam::Error::from)
                .map(|_| ()),
            &role_name,
        )?;
    }
    tolerate_not_found(
        client
            .delete_role()
            .role_name(&role_name)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)
            .map(|_| ()),
        &role_name,
    )?;
    Ok(())
}

/// Deletes the flow-log delivery role, tolerating absence
pub async fn delete_flow_log_role(client: &IamClient, tag: &str) -> Result<(), Error> {
    let role_name = format!("{tag}-flow-logs");
    tolerate_not_found(
        client
            .delete_role_policy()
            .role_name(&role_name)
            .policy_name(FLOW_LOG_POLICY_NAME)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)
            .map(|_| ()),
        &role_name,
    )?;
    tolerate_not_found(
        client
            .delete_role()
            .role_name(&role_name)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)
            .map(|_| ()),
        &role_name,
    )?;
    Ok(())
}

fn tolerate_not_found(
    result: Result<(), aws_sdk_iam::Error>,
    role_name: &str,
) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if is_not_found(&err) => {
            debug!(role = role_name, "IAM entity already deleted");
            Ok(())
        }
        Err(err) => Err(Error::AwsIam(Box::new(err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_policy_targets_the_log_group() {
        let policy = flow_log_delivery_policy("vpc-flow-logs/vpc-123");
        let parsed: serde_json::Value = serde_json::from_str(&policy).unwrap();
        let resource = parsed["Statement"][0]["Resource"].as_str().unwrap();
        assert!(resource.contains("vpc-flow-logs/vpc-123"));
        let actions = parsed["Statement"][0]["Action"].as_array().unwrap();
        assert!(actions
            .iter()
            .any(|action| action == "logs:PutLogEvents"));
    }
}
