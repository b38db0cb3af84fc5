//! `create` subcommand for `aws`

use crate::aws::{
    acm, autoscaling, cidr::SubnetAllocator, deployer_directory, ec2, elb, iam, logs, ports,
    route53, Config, Error, Metadata, Outputs, AZ_COUNT, CREATED_FILE_NAME, DEPLOYMENT_ENV_VAR,
    METADATA_FILE_NAME, OUTPUTS_FILE_NAME,
};
use aws_sdk_ec2::types::InstanceType;
use std::{fs::File, path::PathBuf, time::UNIX_EPOCH};
use tokio::time::{sleep, Duration};
use tracing::info;

/// Instance profiles and delivery roles are eventually consistent; resources
/// referencing one too early fail with an invalid-parameter error
const IAM_PROPAGATION_DELAY: Duration = Duration::from_secs(10);

/// Creates the network topology and, when configured, the SIEM stack for the
/// selected environment
pub async fn create(config_path: &PathBuf) -> Result<(), Error> {
    // Load configuration and select the environment
    let config = Config::load(config_path)?;
    let environment =
        std::env::var(DEPLOYMENT_ENV_VAR).map_err(|_| Error::EnvironmentNotSet)?;
    let env = config.environment(&environment)?;
    env.validate()?;
    let tag = format!("{}-{}", config.name, environment);
    info!(
        tag = tag.as_str(),
        environment = environment.as_str(),
        "loaded configuration"
    );

    // Create the deployment directory
    let tag_directory = deployer_directory(Some(&tag));
    if tag_directory.exists() {
        return Err(Error::CreationAttempted(tag.clone()));
    }
    std::fs::create_dir_all(&tag_directory)?;
    info!(path = ?tag_directory, "created tag directory");

    // Resolve the AWS account context ("safety first")
    let shared_config = crate::aws::load_aws_config(None).await;
    let region = shared_config
        .region()
        .ok_or(Error::RegionNotSet)?
        .to_string();
    info!(region = region.as_str(), "resolved AWS region");

    // Persist deployment metadata early to enable `destroy --tag` on failure
    let metadata = Metadata {
        tag: tag.clone(),
        environment: environment.clone(),
        region: region.clone(),
        created_at: std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default(),
        short_name: env.siem.as_ref().map(|siem| siem.short_name.clone()),
        hosted_zone_name: env.siem.as_ref().map(|siem| siem.hosted_zone_name.clone()),
        balancer: env.siem.as_ref().map(|siem| siem.balancer),
    };
    let metadata_file = File::create(tag_directory.join(METADATA_FILE_NAME))?;
    serde_yaml::to_writer(metadata_file, &metadata)?;
    info!("persisted deployment metadata");

    let ec2_client = aws_sdk_ec2::Client::new(&shared_config);

    // Pick the two availability zones the network spans
    let azs = ec2::find_availability_zones(&ec2_client).await?;
    if azs.len() < AZ_COUNT {
        return Err(Error::NotEnoughAvailabilityZones);
    }
    let azs = &azs[..AZ_COUNT];
    info!(?azs, "selected availability zones");

    // Create the VPC and its internet gateway
    let networking = &env.networking;
    let vpc_name = networking.vpc_name.as_str();
    let vpc_id = ec2::create_vpc(&ec2_client, &networking.vpc_cidr, vpc_name, &tag).await?;
    info!(vpc = vpc_id.as_str(), "created VPC");
    let igw_id =
        ec2::create_and_attach_igw(&ec2_client, &vpc_id, &format!("{vpc_name}-igw"), &tag).await?;
    info!(
        igw = igw_id.as_str(),
        vpc = vpc_id.as_str(),
        "created and attached IGW"
    );

    // Route tables: public routes through the IGW, private stays local until
    // a NAT gateway is added
    let public_rt_id =
        ec2::create_route_table(&ec2_client, &vpc_id, &format!("{vpc_name}-public"), &tag).await?;
    ec2::add_igw_route(&ec2_client, &public_rt_id, &igw_id).await?;
    let private_rt_id =
        ec2::create_route_table(&ec2_client, &vpc_id, &format!("{vpc_name}-private"), &tag).await?;
    info!(
        public = public_rt_id.as_str(),
        private = private_rt_id.as_str(),
        "created route tables"
    );

    // Carve subnets out of the VPC block: public first, then private
    let vpc_block = networking.vpc_cidr.parse()?;
    let mut allocator = SubnetAllocator::new(vpc_block);
    let mut public_subnet_ids = Vec::with_capacity(AZ_COUNT);
    for (idx, az) in azs.iter().enumerate() {
        let subnet_cidr = allocator.next(networking.public_subnet_mask)?.to_string();
        let subnet_id = ec2::create_subnet(
            &ec2_client,
            &vpc_id,
            &public_rt_id,
            &subnet_cidr,
            az,
            true,
            &format!("{vpc_name}-public-{idx}"),
            &tag,
        )
        .await?;
        info!(
            subnet = subnet_id.as_str(),
            cidr = subnet_cidr.as_str(),
            az = az.as_str(),
            "created public subnet"
        );
        public_subnet_ids.push(subnet_id);
    }
    let mut private_subnet_ids = Vec::with_capacity(AZ_COUNT);
    for (idx, az) in azs.iter().enumerate() {
        let subnet_cidr = allocator.next(networking.private_subnet_mask)?.to_string();
        let subnet_id = ec2::create_subnet(
            &ec2_client,
            &vpc_id,
            &private_rt_id,
            &subnet_cidr,
            az,
            false,
            &format!("{vpc_name}-private-{idx}"),
            &tag,
        )
        .await?;
        info!(
            subnet = subnet_id.as_str(),
            cidr = subnet_cidr.as_str(),
            az = az.as_str(),
            "created private subnet"
        );
        private_subnet_ids.push(subnet_id);
    }

    // At most one NAT gateway (cost-driven toggle)
    if networking.enable_nat_gateway {
        let allocation_id =
            ec2::allocate_elastic_ip(&ec2_client, &format!("{vpc_name}-nat"), &tag).await?;
        let nat_id = ec2::create_nat_gateway(
            &ec2_client,
            &public_subnet_ids[0],
            &allocation_id,
            &format!("{vpc_name}-nat"),
            &tag,
        )
        .await?;
        info!(nat = nat_id.as_str(), "created NAT gateway");
        ec2::wait_for_nat_gateway_available(&ec2_client, &nat_id).await?;
        ec2::add_nat_route(&ec2_client, &private_rt_id, &nat_id).await?;
        info!(nat = nat_id.as_str(), "NAT gateway available and routed");
    }

    // Flow logs deliver to a dedicated CloudWatch log group
    if networking.enable_vpc_flow_logs {
        let logs_client = aws_sdk_cloudwatchlogs::Client::new(&shared_config);
        let iam_client = aws_sdk_iam::Client::new(&shared_config);
        let log_group = logs::create_flow_log_group(&logs_client, &vpc_id, &tag).await?;
        let delivery_role_arn = iam::create_flow_log_role(&iam_client, &log_group, &tag).await?;
        sleep(IAM_PROPAGATION_DELAY).await;
        let flow_log_id =
            ec2::create_flow_logs(&ec2_client, &vpc_id, &log_group, &delivery_role_arn, &tag)
                .await?;
        info!(
            flow_log = flow_log_id.as_str(),
            group = log_group.as_str(),
            "enabled VPC flow logs"
        );
    }

    // Private in-network path to S3
    if networking.enable_vpc_endpoints {
        let route_table_ids = vec![public_rt_id.clone(), private_rt_id.clone()];
        let endpoint_id = ec2::create_s3_gateway_endpoint(
            &ec2_client,
            &vpc_id,
            &region,
            &route_table_ids,
            &format!("{vpc_name}-s3"),
            &tag,
        )
        .await?;
        info!(
            endpoint = endpoint_id.as_str(),
            "created S3 gateway endpoint"
        );
    }

    // SIEM stack, only when the environment enables it
    let mut app_url = None;
    let mut lb_dns = None;
    if let Some(siem) = &env.siem {
        let short_name = siem.short_name.as_str();
        let instance_type = InstanceType::try_parse(&siem.instance_type)
            .map_err(|_| Error::InvalidInstanceType(siem.instance_type.clone()))?;

        // Security groups: balancer tier exposed to the allow-list, compute
        // tier exposed only to the balancer tier
        let balancer_sg_id = ec2::create_security_group(
            &ec2_client,
            &vpc_id,
            &format!("{short_name}-lb"),
            &format!("Security group for {short_name} load balancer"),
            &tag,
        )
        .await?;
        ec2::authorize_ingress(
            &ec2_client,
            &balancer_sg_id,
            &ec2::balancer_ingress_rules(&siem.sg_cidrs_list),
        )
        .await?;
        let compute_sg_id = ec2::create_security_group(
            &ec2_client,
            &vpc_id,
            &format!("{short_name}-asg"),
            &format!("Security group for {short_name} auto scaling group"),
            &tag,
        )
        .await?;
        ec2::authorize_ingress(
            &ec2_client,
            &compute_sg_id,
            &ec2::compute_ingress_rules(&balancer_sg_id),
        )
        .await?;
        info!(
            balancer = balancer_sg_id.as_str(),
            compute = compute_sg_id.as_str(),
            "created security groups"
        );

        // Instance role and profile
        let iam_client = aws_sdk_iam::Client::new(&shared_config);
        let instance_profile = iam::create_instance_role(&iam_client, short_name, &tag).await?;
        info!(profile = instance_profile.as_str(), "created instance role");
        sleep(IAM_PROPAGATION_DELAY).await;

        // Resolve the machine image by name
        let image_id = ec2::find_image_by_name(&ec2_client, &siem.ami_name).await?;
        info!(
            ami = image_id.as_str(),
            name = siem.ami_name.as_str(),
            "resolved machine image"
        );

        // Launch template carrying the boot configuration
        let user_data = autoscaling::assemble_user_data(&vpc_id, siem.fleet_type);
        ec2::create_launch_template(
            &ec2_client,
            &autoscaling::launch_template_name(short_name),
            &image_id,
            instance_type,
            &compute_sg_id,
            &instance_profile,
            &autoscaling::encode_user_data(&user_data),
            &tag,
        )
        .await?;

        // The fleet spans the public subnets
        let autoscaling_client = aws_sdk_autoscaling::Client::new(&shared_config);
        let group_name = autoscaling::create_auto_scaling_group(
            &autoscaling_client,
            short_name,
            &public_subnet_ids,
            siem.min_capacity,
            siem.max_capacity,
            siem.desired_capacity,
            &tag,
        )
        .await?;
        info!(asg = group_name.as_str(), "created auto scaling group");

        // Public balancer in the public subnets, fronting the fleet
        let elb_client = aws_sdk_elasticloadbalancingv2::Client::new(&shared_config);
        let balancer = elb::create_load_balancer(
            &elb_client,
            siem.balancer,
            short_name,
            &public_subnet_ids,
            &balancer_sg_id,
            &tag,
        )
        .await?;
        info!(
            balancer = balancer.arn.as_str(),
            dns = balancer.dns_name.as_str(),
            "created load balancer"
        );

        // The hosted zone must pre-exist; compute the service domain from it
        let route53_client = aws_sdk_route53::Client::new(&shared_config);
        let hosted_zone_id =
            route53::find_hosted_zone(&route53_client, &siem.hosted_zone_name).await?;
        let domain = route53::service_domain(&siem.hosted_zone_name);
        info!(
            zone = hosted_zone_id.as_str(),
            domain = domain.as_str(),
            "resolved hosted zone"
        );

        // Request the certificate and complete the DNS challenge
        let acm_client = aws_sdk_acm::Client::new(&shared_config);
        let certificate_arn = acm::request_certificate(&acm_client, &domain, &tag).await?;
        let (record_name, record_value) =
            acm::wait_for_validation_record(&acm_client, &certificate_arn).await?;
        route53::upsert_validation_record(
            &route53_client,
            &hosted_zone_id,
            &record_name,
            &record_value,
        )
        .await?;
        info!(record = record_name.as_str(), "published validation record");
        acm::wait_for_issued(&acm_client, &certificate_arn, &domain).await?;
        info!(certificate = certificate_arn.as_str(), "certificate issued");

        // One health-checked target group and one TLS-terminating listener
        // per exposed service
        let mut target_group_arns = Vec::with_capacity(ports::EXPOSED.len());
        for service in &ports::EXPOSED {
            let target_group_arn = elb::create_target_group(
                &elb_client,
                siem.balancer,
                short_name,
                service,
                &vpc_id,
                &tag,
            )
            .await?;
            target_group_arns.push(target_group_arn);
        }
        autoscaling::attach_target_groups(&autoscaling_client, &group_name, &target_group_arns)
            .await?;
        for (service, target_group_arn) in ports::EXPOSED.iter().zip(&target_group_arns) {
            let listener_arn = elb::create_listener(
                &elb_client,
                siem.balancer,
                &balancer.arn,
                service,
                &certificate_arn,
                target_group_arn,
            )
            .await?;
            info!(
                listener = listener_arn.as_str(),
                service = service.name,
                port = service.port,
                "created listener"
            );
        }

        // Publish the service domain
        route53::upsert_alias_record(
            &route53_client,
            &hosted_zone_id,
            &domain,
            &balancer.dns_name,
            &balancer.canonical_zone_id,
        )
        .await?;
        info!(domain = domain.as_str(), "published alias record");

        app_url = Some(format!("https://{domain}"));
        lb_dns = Some(balancer.dns_name);
    }

    // Publish outputs
    let outputs = Outputs {
        vpc_export_name: format!("MainVpcId-{environment}"),
        vpc_id: vpc_id.clone(),
        app_url: app_url.clone(),
        lb_dns: lb_dns.clone(),
    };
    let outputs_file = File::create(tag_directory.join(OUTPUTS_FILE_NAME))?;
    serde_yaml::to_writer(outputs_file, &outputs)?;

    // Mark deployment as complete
    File::create(tag_directory.join(CREATED_FILE_NAME))?;
    info!(
        vpc = vpc_id.as_str(),
        export = outputs.vpc_export_name.as_str(),
        app = app_url.as_deref().unwrap_or("-"),
        lb = lb_dns.as_deref().unwrap_or("-"),
        "deployment complete"
    );
    Ok(())
}
