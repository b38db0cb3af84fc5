//! `destroy` subcommand for `aws`

use crate::aws::{
    acm, autoscaling, deployer_directory, ec2, elb, iam, logs, route53, Config, Error, Metadata,
    DEPLOYMENT_ENV_VAR, DESTROYED_FILE_NAME, METADATA_FILE_NAME,
};
use aws_sdk_route53::types::RrType;
use std::{fs::File, path::PathBuf};
use tracing::{debug, info};

/// Tears down all resources associated with a deployment, in reverse
/// dependency order. Missing resources are skipped, so a partially created
/// deployment can be destroyed too.
pub async fn destroy(config_path: Option<&PathBuf>, tag: Option<&str>) -> Result<(), Error> {
    // Resolve the deployment tag
    let tag = match (config_path, tag) {
        (_, Some(tag)) => tag.to_string(),
        (Some(config_path), None) => {
            let config = Config::load(config_path)?;
            let environment =
                std::env::var(DEPLOYMENT_ENV_VAR).map_err(|_| Error::EnvironmentNotSet)?;
            config.environment(&environment)?;
            format!("{}-{}", config.name, environment)
        }
        (None, None) => return Err(Error::DeploymentNotFound("unspecified".to_string())),
    };

    // Load persisted metadata
    let tag_directory = deployer_directory(Some(&tag));
    let metadata_path = tag_directory.join(METADATA_FILE_NAME);
    if !metadata_path.exists() {
        return Err(Error::DeploymentNotFound(tag));
    }
    let metadata: Metadata = serde_yaml::from_reader(File::open(&metadata_path)?)?;
    if tag_directory.join(DESTROYED_FILE_NAME).exists() {
        return Err(Error::DeploymentAlreadyDestroyed(tag));
    }
    info!(
        tag = tag.as_str(),
        region = metadata.region.as_str(),
        "destroying deployment"
    );

    let shared_config = crate::aws::load_aws_config(Some(metadata.region.clone())).await;
    let ec2_client = aws_sdk_ec2::Client::new(&shared_config);

    // SIEM resources first (they depend on the network)
    if let Some(short_name) = &metadata.short_name {
        let elb_client = aws_sdk_elasticloadbalancingv2::Client::new(&shared_config);
        elb::delete_load_balancer_stack(&elb_client, short_name).await?;
        info!(balancer = short_name.as_str(), "deleted load balancer stack");

        // DNS records and the certificate, when the zone still exists
        if let Some(hosted_zone_name) = &metadata.hosted_zone_name {
            let route53_client = aws_sdk_route53::Client::new(&shared_config);
            let acm_client = aws_sdk_acm::Client::new(&shared_config);
            let domain = route53::service_domain(hosted_zone_name);
            match route53::find_hosted_zone(&route53_client, hosted_zone_name).await {
                Ok(hosted_zone_id) => {
                    route53::delete_record(&route53_client, &hosted_zone_id, &domain, RrType::A)
                        .await?;
                    info!(domain = domain.as_str(), "deleted alias record");
                    if let Some(certificate_arn) =
                        acm::find_certificate_by_domain(&acm_client, &domain).await?
                    {
                        if let Some((record_name, _)) =
                            acm::validation_record(&acm_client, &certificate_arn).await?
                        {
                            route53::delete_record(
                                &route53_client,
                                &hosted_zone_id,
                                &record_name,
                                RrType::Cname,
                            )
                            .await?;
                            info!(record = record_name.as_str(), "deleted validation record");
                        }
                        acm::delete_certificate(&acm_client, &certificate_arn).await?;
                        info!(
                            certificate = certificate_arn.as_str(),
                            "deleted certificate"
                        );
                    }
                }
                Err(Error::HostedZoneNotFound(zone)) => {
                    debug!(zone = zone.as_str(), "hosted zone gone, skipping DNS cleanup");
                }
                Err(err) => return Err(err),
            }
        }

        // Fleet, launch template, and instance role
        let autoscaling_client = aws_sdk_autoscaling::Client::new(&shared_config);
        autoscaling::delete_auto_scaling_group(&autoscaling_client, short_name).await?;
        info!(asg = short_name.as_str(), "deleted auto scaling group");
        ec2::delete_launch_template(&ec2_client, &autoscaling::launch_template_name(short_name))
            .await?;
        let iam_client = aws_sdk_iam::Client::new(&shared_config);
        iam::delete_instance_role(&iam_client, short_name).await?;
        info!(role = short_name.as_str(), "deleted instance role");

        // Security groups drain once the balancer and instances are gone
        for group_id in ec2::find_security_groups_by_tag(&ec2_client, &tag).await? {
            ec2::delete_security_group(&ec2_client, &group_id).await?;
            info!(sg = group_id.as_str(), "deleted security group");
        }
    }

    // Network resources last
    if let Some(vpc_id) = ec2::find_vpc_by_tag(&ec2_client, &tag).await? {
        ec2::delete_vpc_endpoints(&ec2_client, &tag).await?;
        ec2::delete_flow_logs(&ec2_client, &vpc_id).await?;
        let logs_client = aws_sdk_cloudwatchlogs::Client::new(&shared_config);
        logs::delete_flow_log_group(&logs_client, &vpc_id).await?;
        let iam_client = aws_sdk_iam::Client::new(&shared_config);
        iam::delete_flow_log_role(&iam_client, &tag).await?;
        ec2::delete_nat_gateways(&ec2_client, &tag).await?;
        ec2::release_elastic_ips(&ec2_client, &tag).await?;
        ec2::delete_network(&ec2_client, &vpc_id).await?;
        info!(vpc = vpc_id.as_str(), "deleted network");
    } else {
        debug!(tag = tag.as_str(), "no VPC found, nothing to delete");
    }

    // Mark deployment as destroyed
    File::create(tag_directory.join(DESTROYED_FILE_NAME))?;
    info!(tag = tag.as_str(), "destruction complete");
    Ok(())
}
