//! AWS EC2 SDK function wrappers for network and security-group resources

use crate::aws::{is_not_found, ports, Error, TAG_KEY};
use aws_sdk_ec2::{
    types::{
        AttributeBooleanValue, DomainType, Filter, FlowLogsResourceType, InstanceType, IpPermission,
        IpRange, LaunchTemplateIamInstanceProfileSpecificationRequest, LogDestinationType,
        RequestLaunchTemplateData, ResourceType, Tag, TagSpecification, TrafficType,
        UserIdGroupPair, VpcEndpointType,
    },
    Client as Ec2Client,
};
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Interval between polling attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum polling attempts while waiting for a resource transition
const POLL_ATTEMPTS: usize = 60;

fn sdk_err<E>(err: E) -> Error
where
    aws_sdk_ec2::Error: From<E>,
{
    Error::AwsEc2(Box::new(err.into()))
}

/// Builds the tag specification attached to every EC2 resource
fn tag_specifications(resource_type: ResourceType, name: &str, tag: &str) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(Tag::builder().key("Name").value(name).build())
        .tags(Tag::builder().key(TAG_KEY).value(tag).build())
        .build()
}

/// Filter matching resources stamped with the deployment tag
pub fn deployment_filter(tag: &str) -> Filter {
    Filter::builder()
        .name(format!("tag:{TAG_KEY}"))
        .values(tag)
        .build()
}

/// Returns the names of the available zones in the region, sorted
pub async fn find_availability_zones(client: &Ec2Client) -> Result<Vec<String>, Error> {
    let resp = client
        .describe_availability_zones()
        .filters(
            Filter::builder()
                .name("state")
                .values("available")
                .build(),
        )
        .send()
        .await
        .map_err(sdk_err)?;
    let mut azs: Vec<String> = resp
        .availability_zones()
        .iter()
        .filter_map(|az| az.zone_name().map(String::from))
        .collect();
    azs.sort();
    Ok(azs)
}

/// Creates a VPC with DNS support and hostnames enabled
pub async fn create_vpc(
    client: &Ec2Client,
    cidr: &str,
    name: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .create_vpc()
        .cidr_block(cidr)
        .tag_specifications(tag_specifications(ResourceType::Vpc, name, tag))
        .send()
        .await
        .map_err(sdk_err)?;
    let vpc_id = resp
        .vpc()
        .and_then(|vpc| vpc.vpc_id())
        .ok_or(Error::MissingResponse("VPC id"))?
        .to_string();

    // DNS attributes must be toggled one per call
    client
        .modify_vpc_attribute()
        .vpc_id(&vpc_id)
        .enable_dns_support(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(sdk_err)?;
    client
        .modify_vpc_attribute()
        .vpc_id(&vpc_id)
        .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(vpc_id)
}

/// Creates an internet gateway and attaches it to the VPC
pub async fn create_and_attach_igw(
    client: &Ec2Client,
    vpc_id: &str,
    name: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .create_internet_gateway()
        .tag_specifications(tag_specifications(ResourceType::InternetGateway, name, tag))
        .send()
        .await
        .map_err(sdk_err)?;
    let igw_id = resp
        .internet_gateway()
        .and_then(|igw| igw.internet_gateway_id())
        .ok_or(Error::MissingResponse("internet gateway id"))?
        .to_string();
    client
        .attach_internet_gateway()
        .internet_gateway_id(&igw_id)
        .vpc_id(vpc_id)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(igw_id)
}

/// Creates an empty route table in the VPC
pub async fn create_route_table(
    client: &Ec2Client,
    vpc_id: &str,
    name: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .create_route_table()
        .vpc_id(vpc_id)
        .tag_specifications(tag_specifications(ResourceType::RouteTable, name, tag))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .route_table()
        .and_then(|rt| rt.route_table_id())
        .ok_or(Error::MissingResponse("route table id"))?
        .to_string())
}

/// Adds a default route through an internet gateway
pub async fn add_igw_route(
    client: &Ec2Client,
    route_table_id: &str,
    igw_id: &str,
) -> Result<(), Error> {
    client
        .create_route()
        .route_table_id(route_table_id)
        .destination_cidr_block("0.0.0.0/0")
        .gateway_id(igw_id)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(())
}

/// Adds a default route through a NAT gateway
pub async fn add_nat_route(
    client: &Ec2Client,
    route_table_id: &str,
    nat_id: &str,
) -> Result<(), Error> {
    client
        .create_route()
        .route_table_id(route_table_id)
        .destination_cidr_block("0.0.0.0/0")
        .nat_gateway_id(nat_id)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(())
}

/// Creates a subnet and associates it with a route table. Public subnets map
/// public IPs on launch.
#[allow(clippy::too_many_arguments)]
pub async fn create_subnet(
    client: &Ec2Client,
    vpc_id: &str,
    route_table_id: &str,
    cidr: &str,
    az: &str,
    public: bool,
    name: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .create_subnet()
        .vpc_id(vpc_id)
        .cidr_block(cidr)
        .availability_zone(az)
        .tag_specifications(tag_specifications(ResourceType::Subnet, name, tag))
        .send()
        .await
        .map_err(sdk_err)?;
    let subnet_id = resp
        .subnet()
        .and_then(|subnet| subnet.subnet_id())
        .ok_or(Error::MissingResponse("subnet id"))?
        .to_string();
    if public {
        client
            .modify_subnet_attribute()
            .subnet_id(&subnet_id)
            .map_public_ip_on_launch(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await
            .map_err(sdk_err)?;
    }
    client
        .associate_route_table()
        .route_table_id(route_table_id)
        .subnet_id(&subnet_id)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(subnet_id)
}

/// Allocates an Elastic IP for a NAT gateway
pub async fn allocate_elastic_ip(
    client: &Ec2Client,
    name: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .allocate_address()
        .domain(DomainType::Vpc)
        .tag_specifications(tag_specifications(ResourceType::ElasticIp, name, tag))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .allocation_id()
        .ok_or(Error::MissingResponse("allocation id"))?
        .to_string())
}

/// Creates a NAT gateway in the given public subnet
pub async fn create_nat_gateway(
    client: &Ec2Client,
    subnet_id: &str,
    allocation_id: &str,
    name: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .create_nat_gateway()
        .subnet_id(subnet_id)
        .allocation_id(allocation_id)
        .tag_specifications(tag_specifications(ResourceType::Natgateway, name, tag))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .nat_gateway()
        .and_then(|nat| nat.nat_gateway_id())
        .ok_or(Error::MissingResponse("NAT gateway id"))?
        .to_string())
}

/// Polls a NAT gateway until it is available
pub async fn wait_for_nat_gateway_available(
    client: &Ec2Client,
    nat_id: &str,
) -> Result<(), Error> {
    use aws_sdk_ec2::types::NatGatewayState;
    for _ in 0..POLL_ATTEMPTS {
        let resp = client
            .describe_nat_gateways()
            .nat_gateway_ids(nat_id)
            .send()
            .await
            .map_err(sdk_err)?;
        let state = resp
            .nat_gateways()
            .first()
            .and_then(|nat| nat.state().cloned());
        match state {
            Some(NatGatewayState::Available) => return Ok(()),
            Some(NatGatewayState::Failed) => {
                return Err(Error::NatGatewayNotAvailable(nat_id.to_string()))
            }
            _ => sleep(RETRY_INTERVAL).await,
        }
    }
    Err(Error::NatGatewayNotAvailable(nat_id.to_string()))
}

/// Source of an ingress rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleSource {
    /// An IPv4 CIDR block
    Cidr(String),
    /// Another security group, referenced by id
    Group(String),
}

/// A single ingress rule on a security group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressRule {
    pub port: u16,
    pub source: RuleSource,
    pub description: String,
}

/// Computes the balancer-tier ingress rules: one rule per allowed CIDR per
/// exposed service port.
pub fn balancer_ingress_rules(cidrs: &[String]) -> Vec<IngressRule> {
    let mut rules = Vec::with_capacity(cidrs.len() * ports::EXPOSED.len());
    for cidr in cidrs {
        for service in ports::EXPOSED {
            rules.push(IngressRule {
                port: service.port,
                source: RuleSource::Cidr(cidr.clone()),
                description: format!("Allow {} traffic from {cidr}", service.name),
            });
        }
    }
    rules
}

/// Computes the compute-tier ingress rules: one rule per exposed service
/// port, each sourced from the balancer-tier group and never from a CIDR.
pub fn compute_ingress_rules(balancer_sg_id: &str) -> Vec<IngressRule> {
    ports::EXPOSED
        .iter()
        .map(|service| IngressRule {
            port: service.port,
            source: RuleSource::Group(balancer_sg_id.to_string()),
            description: format!("Allow {} traffic from the balancer tier", service.name),
        })
        .collect()
}

/// Creates an empty security group in the VPC
pub async fn create_security_group(
    client: &Ec2Client,
    vpc_id: &str,
    name: &str,
    description: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .create_security_group()
        .group_name(name)
        .description(description)
        .vpc_id(vpc_id)
        .tag_specifications(tag_specifications(ResourceType::SecurityGroup, name, tag))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .group_id()
        .ok_or(Error::MissingResponse("security group id"))?
        .to_string())
}

/// Authorizes a set of ingress rules on a security group
pub async fn authorize_ingress(
    client: &Ec2Client,
    group_id: &str,
    rules: &[IngressRule],
) -> Result<(), Error> {
    let mut request = client.authorize_security_group_ingress().group_id(group_id);
    for rule in rules {
        let permission = IpPermission::builder()
            .ip_protocol("tcp")
            .from_port(rule.port as i32)
            .to_port(rule.port as i32);
        let permission = match &rule.source {
            RuleSource::Cidr(cidr) => permission.ip_ranges(
                IpRange::builder()
                    .cidr_ip(cidr)
                    .description(&rule.description)
                    .build(),
            ),
            RuleSource::Group(source_group) => permission.user_id_group_pairs(
                UserIdGroupPair::builder()
                    .group_id(source_group)
                    .description(&rule.description)
                    .build(),
            ),
        };
        request = request.ip_permissions(permission.build());
    }
    request.send().await.map_err(sdk_err)?;
    Ok(())
}

/// Enables ALL-traffic flow logs on the VPC, delivered to CloudWatch Logs
pub async fn create_flow_logs(
    client: &Ec2Client,
    vpc_id: &str,
    log_group_name: &str,
    delivery_role_arn: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .create_flow_logs()
        .resource_ids(vpc_id)
        .resource_type(FlowLogsResourceType::Vpc)
        .traffic_type(TrafficType::All)
        .log_destination_type(LogDestinationType::CloudWatchLogs)
        .log_group_name(log_group_name)
        .deliver_logs_permission_arn(delivery_role_arn)
        .tag_specifications(tag_specifications(
            ResourceType::VpcFlowLog,
            log_group_name,
            tag,
        ))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .flow_log_ids()
        .first()
        .ok_or(Error::MissingResponse("flow log id"))?
        .to_string())
}

/// Creates an S3 gateway endpoint associated with the given route tables
pub async fn create_s3_gateway_endpoint(
    client: &Ec2Client,
    vpc_id: &str,
    region: &str,
    route_table_ids: &[String],
    name: &str,
    tag: &str,
) -> Result<String, Error> {
    let mut request = client
        .create_vpc_endpoint()
        .vpc_id(vpc_id)
        .service_name(format!("com.amazonaws.{region}.s3"))
        .vpc_endpoint_type(VpcEndpointType::Gateway)
        .tag_specifications(tag_specifications(ResourceType::VpcEndpoint, name, tag));
    for route_table_id in route_table_ids {
        request = request.route_table_ids(route_table_id);
    }
    let resp = request.send().await.map_err(sdk_err)?;
    Ok(resp
        .vpc_endpoint()
        .and_then(|endpoint| endpoint.vpc_endpoint_id())
        .ok_or(Error::MissingResponse("VPC endpoint id"))?
        .to_string())
}

/// Resolves the most recent available AMI matching a name pattern.
///
/// Name lookups are not reproducible across time: re-running after the
/// publisher pushes a new image resolves to a different id.
pub async fn find_image_by_name(client: &Ec2Client, ami_name: &str) -> Result<String, Error> {
    let resp = client
        .describe_images()
        .filters(Filter::builder().name("name").values(ami_name).build())
        .filters(Filter::builder().name("state").values("available").build())
        .send()
        .await
        .map_err(sdk_err)?;
    let image = resp
        .images()
        .iter()
        .max_by(|a, b| a.creation_date().cmp(&b.creation_date()))
        .ok_or_else(|| Error::AmiNotFound(ami_name.to_string()))?;
    Ok(image
        .image_id()
        .ok_or(Error::MissingResponse("image id"))?
        .to_string())
}

/// Creates a launch template for the compute fleet
#[allow(clippy::too_many_arguments)]
pub async fn create_launch_template(
    client: &Ec2Client,
    name: &str,
    image_id: &str,
    instance_type: InstanceType,
    security_group_id: &str,
    instance_profile_name: &str,
    user_data_b64: &str,
    tag: &str,
) -> Result<(), Error> {
    client
        .create_launch_template()
        .launch_template_name(name)
        .launch_template_data(
            RequestLaunchTemplateData::builder()
                .image_id(image_id)
                .instance_type(instance_type)
                .security_group_ids(security_group_id)
                .iam_instance_profile(
                    LaunchTemplateIamInstanceProfileSpecificationRequest::builder()
                        .name(instance_profile_name)
                        .build(),
                )
                .user_data(user_data_b64)
                .build(),
        )
        .tag_specifications(tag_specifications(ResourceType::LaunchTemplate, name, tag))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(())
}

/// Deletes a launch template, tolerating absence
pub async fn delete_launch_template(client: &Ec2Client, name: &str) -> Result<(), Error> {
    match client
        .delete_launch_template()
        .launch_template_name(name)
        .send()
        .await
    {
        Ok(_) => Ok(()),
        Err(err) => {
            let err = aws_sdk_ec2::Error::from(err);
            if is_not_found(&err) {
                debug!(template = name, "launch template already deleted");
                Ok(())
            } else {
                Err(Error::AwsEc2(Box::new(err)))
            }
        }
    }
}

/// Finds the deployment's VPC by tag, if it still exists
pub async fn find_vpc_by_tag(client: &Ec2Client, tag: &str) -> Result<Option<String>, Error> {
    let resp = client
        .describe_vpcs()
        .filters(deployment_filter(tag))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .vpcs()
        .first()
        .and_then(|vpc| vpc.vpc_id())
        .map(String::from))
}

/// Lists the deployment's security group ids
pub async fn find_security_groups_by_tag(
    client: &Ec2Client,
    tag: &str,
) -> Result<Vec<String>, Error> {
    let resp = client
        .describe_security_groups()
        .filters(deployment_filter(tag))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .security_groups()
        .iter()
        .filter_map(|sg| sg.group_id().map(String::from))
        .collect())
}

/// Deletes a security group, retrying while network interfaces drain
pub async fn delete_security_group(client: &Ec2Client, group_id: &str) -> Result<(), Error> {
    for _ in 0..POLL_ATTEMPTS {
        match client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if is_not_found(&err) {
                    debug!(sg = group_id, "security group already deleted");
                    return Ok(());
                }
                // DependencyViolation: an ENI from the balancer or a draining
                // instance still references the group
                if matches!(
                    aws_smithy_types::error::metadata::ProvideErrorMetadata::code(&err),
                    Some("DependencyViolation")
                ) {
                    sleep(RETRY_INTERVAL).await;
                    continue;
                }
                return Err(Error::AwsEc2(Box::new(err)));
            }
        }
    }
    Err(Error::Timeout("security group deletion"))
}

/// Deletes the deployment's flow logs, if any
pub async fn delete_flow_logs(client: &Ec2Client, vpc_id: &str) -> Result<(), Error> {
    let resp = client
        .describe_flow_logs()
        .filter(
            Filter::builder()
                .name("resource-id")
                .values(vpc_id)
                .build(),
        )
        .send()
        .await
        .map_err(sdk_err)?;
    let flow_log_ids: Vec<String> = resp
        .flow_logs()
        .iter()
        .filter_map(|fl| fl.flow_log_id().map(String::from))
        .collect();
    if flow_log_ids.is_empty() {
        return Ok(());
    }
    client
        .delete_flow_logs()
        .set_flow_log_ids(Some(flow_log_ids))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(())
}

/// Deletes the deployment's VPC endpoints, if any
pub async fn delete_vpc_endpoints(client: &Ec2Client, tag: &str) -> Result<(), Error> {
    let resp = client
        .describe_vpc_endpoints()
        .filters(deployment_filter(tag))
        .send()
        .await
        .map_err(sdk_err)?;
    let endpoint_ids: Vec<String> = resp
        .vpc_endpoints()
        .iter()
        .filter_map(|endpoint| endpoint.vpc_endpoint_id().map(String::from))
        .collect();
    if endpoint_ids.is_empty() {
        return Ok(());
    }
    client
        .delete_vpc_endpoints()
        .set_vpc_endpoint_ids(Some(endpoint_ids))
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(())
}

/// Deletes the deployment's NAT gateways and waits for them to disappear
pub async fn delete_nat_gateways(client: &Ec2Client, tag: &str) -> Result<(), Error> {
    use aws_sdk_ec2::types::NatGatewayState;
    let resp = client
        .describe_nat_gateways()
        .filter(deployment_filter(tag))
        .send()
        .await
        .map_err(sdk_err)?;
    let nat_ids: Vec<String> = resp
        .nat_gateways()
        .iter()
        .filter(|nat| {
            !matches!(
                nat.state(),
                Some(NatGatewayState::Deleted) | Some(NatGatewayState::Deleting)
            )
        })
        .filter_map(|nat| nat.nat_gateway_id().map(String::from))
        .collect();
    for nat_id in &nat_ids {
        client
            .delete_nat_gateway()
            .nat_gateway_id(nat_id)
            .send()
            .await
            .map_err(sdk_err)?;
    }
    for nat_id in &nat_ids {
        for _ in 0..POLL_ATTEMPTS {
            let resp = client
                .describe_nat_gateways()
                .nat_gateway_ids(nat_id)
                .send()
                .await
                .map_err(sdk_err)?;
            let deleted = resp
                .nat_gateways()
                .first()
                .map(|nat| matches!(nat.state(), Some(NatGatewayState::Deleted)))
                .unwrap_or(true);
            if deleted {
                break;
            }
            sleep(RETRY_INTERVAL).await;
        }
    }
    Ok(())
}

/// Releases the deployment's Elastic IPs
pub async fn release_elastic_ips(client: &Ec2Client, tag: &str) -> Result<(), Error> {
    let resp = client
        .describe_addresses()
        .filters(deployment_filter(tag))
        .send()
        .await
        .map_err(sdk_err)?;
    for address in resp.addresses() {
        if let Some(allocation_id) = address.allocation_id() {
            client
                .release_address()
                .allocation_id(allocation_id)
                .send()
                .await
                .map_err(sdk_err)?;
        }
    }
    Ok(())
}

/// Deletes the VPC's subnets, route tables, internet gateway, and finally the
/// VPC itself
pub async fn delete_network(client: &Ec2Client, vpc_id: &str) -> Result<(), Error> {
    let vpc_filter = Filter::builder().name("vpc-id").values(vpc_id).build();

    let subnets = client
        .describe_subnets()
        .filters(vpc_filter.clone())
        .send()
        .await
        .map_err(sdk_err)?;
    for subnet in subnets.subnets() {
        if let Some(subnet_id) = subnet.subnet_id() {
            client
                .delete_subnet()
                .subnet_id(subnet_id)
                .send()
                .await
                .map_err(sdk_err)?;
        }
    }

    let route_tables = client
        .describe_route_tables()
        .filters(vpc_filter.clone())
        .send()
        .await
        .map_err(sdk_err)?;
    for route_table in route_tables.route_tables() {
        let main = route_table
            .associations()
            .iter()
            .any(|association| association.main().unwrap_or(false));
        if main {
            continue;
        }
        if let Some(route_table_id) = route_table.route_table_id() {
            client
                .delete_route_table()
                .route_table_id(route_table_id)
                .send()
                .await
                .map_err(sdk_err)?;
        }
    }

    let igws = client
        .describe_internet_gateways()
        .filters(
            Filter::builder()
                .name("attachment.vpc-id")
                .values(vpc_id)
                .build(),
        )
        .send()
        .await
        .map_err(sdk_err)?;
    for igw in igws.internet_gateways() {
        if let Some(igw_id) = igw.internet_gateway_id() {
            client
                .detach_internet_gateway()
                .internet_gateway_id(igw_id)
                .vpc_id(vpc_id)
                .send()
                .await
                .map_err(sdk_err)?;
            client
                .delete_internet_gateway()
                .internet_gateway_id(igw_id)
                .send()
                .await
                .map_err(sdk_err)?;
        }
    }

    client
        .delete_vpc()
        .vpc_id(vpc_id)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balancer_rules_cover_every_cidr_and_port() {
        let cidrs = vec!["1.2.3.4/32".to_string(), "10.10.0.0/16".to_string()];
        let rules = balancer_ingress_rules(&cidrs);
        assert_eq!(rules.len(), cidrs.len() * ports::EXPOSED.len());
        for cidr in &cidrs {
            for service in ports::EXPOSED {
                let matching: Vec<_> = rules
                    .iter()
                    .filter(|rule| {
                        rule.port == service.port
                            && rule.source == RuleSource::Cidr(cidr.clone())
                    })
                    .collect();
                assert_eq!(matching.len(), 1, "{} x {}", cidr, service.port);
            }
        }
    }

    #[test]
    fn compute_rules_only_reference_the_balancer_group() {
        let rules = compute_ingress_rules("sg-0123456789abcdef0");
        assert_eq!(rules.len(), ports::EXPOSED.len());
        let mut rule_ports: Vec<u16> = rules.iter().map(|rule| rule.port).collect();
        rule_ports.sort_unstable();
        let mut exposed: Vec<u16> = ports::EXPOSED.iter().map(|service| service.port).collect();
        exposed.sort_unstable();
        assert_eq!(rule_ports, exposed);
        for rule in &rules {
            assert_eq!(
                rule.source,
                RuleSource::Group("sg-0123456789abcdef0".to_string()),
                "compute tier must never allow a raw CIDR"
            );
        }
    }
}
