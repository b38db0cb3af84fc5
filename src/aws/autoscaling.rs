//! Auto Scaling Group for the SIEM fleet, including boot configuration

use crate::aws::{is_not_found, Error, FleetType, TAG_KEY};
use aws_sdk_autoscaling::{
    types::{LaunchTemplateSpecification, Tag},
    Client as AutoScalingClient,
};
use base64::Engine;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Boot script for server fleets, injected verbatim after the exports
const SERVER_BOOT_SCRIPT: &str = include_str!("../../scripts/server_boot.sh");

/// Boot script for agent fleets, injected verbatim after the exports
const AGENT_BOOT_SCRIPT: &str = include_str!("../../scripts/agent_boot.sh");

/// Maximum polling attempts while waiting for the group to drain
const ASG_POLL_ATTEMPTS: usize = 120;

/// Interval between polling attempts
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

fn sdk_err<E>(err: E) -> Error
where
    aws_sdk_autoscaling::Error: From<E>,
{
    Error::AwsAutoScaling(Box::new(err.into()))
}

/// Name of the fleet's Auto Scaling Group
pub fn group_name(short_name: &str) -> String {
    format!("{short_name}v1")
}

/// Name of the fleet's launch template
pub fn launch_template_name(short_name: &str) -> String {
    format!("{short_name}-launch-template")
}

/// Assembles instance user data: the network-identifier export first, then
/// the fleet-type-selected boot script, verbatim.
pub fn assemble_user_data(vpc_id: &str, fleet_type: FleetType) -> String {
    let script = match fleet_type {
        FleetType::Server => SERVER_BOOT_SCRIPT,
        FleetType::Agent => AGENT_BOOT_SCRIPT,
    };
    format!("#!/bin/bash\necho export VPC_ID={vpc_id} >> /etc/profile\n{script}")
}

/// Base64-encodes user data for the launch template
pub fn encode_user_data(user_data: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(user_data)
}

/// Creates the Auto Scaling Group spanning the given subnets
#[allow(clippy::too_many_arguments)]
pub async fn create_auto_scaling_group(
    client: &AutoScalingClient,
    short_name: &str,
    subnet_ids: &[String],
    min_capacity: u32,
    max_capacity: u32,
    desired_capacity: u32,
    tag: &str,
) -> Result<String, Error> {
    let name = group_name(short_name);
    client
        .create_auto_scaling_group()
        .auto_scaling_group_name(&name)
        .launch_template(
            LaunchTemplateSpecification::builder()
                .launch_template_name(launch_template_name(short_name))
                .version("$Latest")
                .build(),
        )
        .min_size(min_capacity as i32)
        .max_size(max_capacity as i32)
        .desired_capacity(desired_capacity as i32)
        .vpc_zone_identifier(subnet_ids.join(","))
        .tags(
            Tag::builder()
                .key("Name")
                .value(&name)
                .propagate_at_launch(true)
                .build()?,
        )
        .tags(
            Tag::builder()
                .key(TAG_KEY)
                .value(tag)
                .propagate_at_launch(true)
                .build()?,
        )
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(name)
}

/// Attaches the fleet to the given target groups
pub async fn attach_target_groups(
    client: &AutoScalingClient,
    group_name: &str,
    target_group_arns: &[String],
) -> Result<(), Error> {
    // The API accepts at most 10 target groups per call
    for chunk in target_group_arns.chunks(10) {
        client
            .attach_load_balancer_target_groups()
            .auto_scaling_group_name(group_name)
            .set_target_group_arns(Some(chunk.to_vec()))
            .send()
            .await
            .map_err(sdk_err)?;
    }
    Ok(())
}

/// Deletes the Auto Scaling Group (terminating its instances) and waits for
/// it to disappear, tolerating absence
pub async fn delete_auto_scaling_group(
    client: &AutoScalingClient,
    short_name: &str,
) -> Result<(), Error> {
    let name = group_name(short_name);
    match client
        .delete_auto_scaling_group()
        .auto_scaling_group_name(&name)
        .force_delete(true)
        .send()
        .await
    {
        Ok(_) => {}
        Err(err) => {
            let err = aws_sdk_autoscaling::Error::from(err);
            if is_not_found(&err) {
                debug!(asg = name.as_str(), "auto scaling group already deleted");
                return Ok(());
            }
            return Err(Error::AwsAutoScaling(Box::new(err)));
        }
    }
    for _ in 0..ASG_POLL_ATTEMPTS {
        let resp = client
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&name)
            .send()
            .await
            .map_err(sdk_err)?;
        if resp.auto_scaling_groups().is_empty() {
            return Ok(());
        }
        sleep(RETRY_INTERVAL).await;
    }
    Err(Error::Timeout("auto scaling group deletion"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_exports_vpc_id_before_the_boot_script() {
        let user_data = assemble_user_data("vpc-0abc", FleetType::Server);
        let export_at = user_data
            .find("echo export VPC_ID=vpc-0abc >> /etc/profile")
            .unwrap();
        let script_at = user_data.find("SIEM server bootstrap").unwrap();
        assert!(user_data.starts_with("#!/bin/bash\n"));
        assert!(export_at < script_at);
    }

    #[test]
    fn fleet_type_selects_the_boot_script() {
        let server = assemble_user_data("vpc-0abc", FleetType::Server);
        let agent = assemble_user_data("vpc-0abc", FleetType::Agent);
        assert!(server.contains("wazuh-install.sh"));
        assert!(agent.contains("wazuh-agent"));
        assert_ne!(server, agent);
    }

    #[test]
    fn user_data_round_trips_through_base64() {
        let user_data = assemble_user_data("vpc-0abc", FleetType::Agent);
        let encoded = encode_user_data(&user_data);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), user_data);
    }

    #[test]
    fn resource_names_derive_from_the_short_name() {
        assert_eq!(group_name("wazuh"), "wazuhv1");
        assert_eq!(launch_template_name("wazuh"), "wazuh-launch-template");
    }
}
