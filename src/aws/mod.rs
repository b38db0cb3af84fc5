//! AWS deployment of a VPC network topology and an optional SIEM stack.
//!
//! The YAML configuration is keyed by environment; the active environment is
//! selected with the `DEPLOYMENT_ENVIRONMENT` environment variable. Every
//! resource is tagged with the deployment tag `<name>-<environment>` so that
//! `destroy` can discover and remove it later.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, path::PathBuf};
use thiserror::Error;

pub mod acm;
pub mod autoscaling;
pub mod cidr;
mod create;
pub use create::create;
mod destroy;
pub use destroy::destroy;
pub mod ec2;
pub mod elb;
pub mod iam;
mod list;
pub use list::list;
pub mod logs;
pub mod route53;

pub const CMD: &str = "aws";
pub const CREATE_CMD: &str = "create";
pub const DESTROY_CMD: &str = "destroy";
pub const LIST_CMD: &str = "list";

/// Environment variable selecting the environment to deploy
pub const DEPLOYMENT_ENV_VAR: &str = "DEPLOYMENT_ENVIRONMENT";

/// Tag key attached to every resource created by this tool
pub const TAG_KEY: &str = "siem-deployer";

/// Subdomain published in front of the configured hosted zone
pub const DNS_SUBDOMAIN: &str = "siem";

/// Number of availability zones every network spans
pub const AZ_COUNT: usize = 2;

/// File marking a deployment as fully created
pub const CREATED_FILE_NAME: &str = "created";

/// File marking a deployment as destroyed
pub const DESTROYED_FILE_NAME: &str = "destroyed";

/// Deployment metadata persisted at creation time
pub const METADATA_FILE_NAME: &str = "metadata.yaml";

/// Stack outputs persisted once creation completes
pub const OUTPUTS_FILE_NAME: &str = "outputs.yaml";

/// Exposed service ports, shared by the security-group and load-balancer
/// builders so the two can never drift apart.
pub mod ports {
    /// A service exposed through the balancer tier
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Service {
        pub name: &'static str,
        pub port: u16,
    }

    /// Web dashboard (HTTPS)
    pub const DASHBOARD: Service = Service {
        name: "dashboard",
        port: 443,
    };

    /// Indexer REST API
    pub const INDEXER: Service = Service {
        name: "indexer",
        port: 9200,
    };

    /// Agent event collection
    pub const AGENT_EVENTS: Service = Service {
        name: "agent-events",
        port: 1514,
    };

    /// Agent enrollment
    pub const AGENT_ENROLLMENT: Service = Service {
        name: "agent-enroll",
        port: 1515,
    };

    /// Manager REST API
    pub const MANAGER_API: Service = Service {
        name: "manager-api",
        port: 55000,
    };

    /// Every service exposed through the balancer tier, in listener order
    pub const EXPOSED: [Service; 5] = [
        DASHBOARD,
        INDEXER,
        AGENT_EVENTS,
        AGENT_ENROLLMENT,
        MANAGER_API,
    ];
}

/// Which boot script a fleet runs at instance startup
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FleetType {
    #[default]
    Server,
    Agent,
}

/// Which load balancer variant fronts the fleet
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    Network,
    Application,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct NetworkingConfig {
    pub vpc_name: String,
    pub vpc_cidr: String,
    pub enable_nat_gateway: bool,
    pub public_subnet_mask: u8,
    pub private_subnet_mask: u8,
    pub enable_vpc_flow_logs: bool,
    pub enable_vpc_endpoints: bool,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SiemConfig {
    pub short_name: String,
    pub sg_cidrs_list: Vec<String>,
    pub instance_type: String,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub desired_capacity: u32,
    pub ami_name: String,
    pub hosted_zone_name: String,
    #[serde(default)]
    pub fleet_type: FleetType,
    #[serde(default)]
    pub balancer: BalancerKind,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Environment {
    pub networking: NetworkingConfig,
    #[serde(default)]
    pub siem: Option<SiemConfig>,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub name: String,
    pub environments: BTreeMap<String, Environment>,
}

impl Config {
    /// Loads a configuration from a YAML file. Missing required keys and
    /// unrecognized keys both fail deserialization.
    pub fn load(path: &PathBuf) -> Result<Self, Error> {
        let config_file = File::open(path)?;
        Ok(serde_yaml::from_reader(config_file)?)
    }

    /// Returns the named environment, or an error if the configuration does
    /// not define it.
    pub fn environment(&self, name: &str) -> Result<&Environment, Error> {
        self.environments
            .get(name)
            .ok_or_else(|| Error::UnknownEnvironment(name.to_string()))
    }
}

impl Environment {
    /// Validates everything that can be checked before the first AWS call.
    pub fn validate(&self) -> Result<(), Error> {
        let vpc: cidr::CidrBlock = self.networking.vpc_cidr.parse()?;
        for mask in [
            self.networking.public_subnet_mask,
            self.networking.private_subnet_mask,
        ] {
            if mask <= vpc.prefix() || mask > 28 {
                return Err(Error::InvalidSubnetMask {
                    mask,
                    vpc_prefix: vpc.prefix(),
                });
            }
        }
        if let Some(siem) = &self.siem {
            if siem.min_capacity > siem.desired_capacity
                || siem.desired_capacity > siem.max_capacity
            {
                return Err(Error::InvalidCapacity {
                    min: siem.min_capacity,
                    desired: siem.desired_capacity,
                    max: siem.max_capacity,
                });
            }
            if siem.sg_cidrs_list.is_empty() {
                return Err(Error::EmptyCidrAllowList);
            }
            for entry in &siem.sg_cidrs_list {
                entry.parse::<cidr::CidrBlock>()?;
            }
            if siem.hosted_zone_name.trim_matches('.').is_empty() {
                return Err(Error::EmptyHostedZoneName);
            }
        }
        Ok(())
    }
}

/// Metadata persisted alongside a deployment, sufficient for `destroy --tag`
#[derive(Serialize, Deserialize, Clone)]
pub struct Metadata {
    pub tag: String,
    pub environment: String,
    pub region: String,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_zone_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balancer: Option<BalancerKind>,
}

/// Values published once a deployment completes
#[derive(Serialize, Deserialize, Clone)]
pub struct Outputs {
    pub vpc_export_name: String,
    pub vpc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_dns: Option<String>,
}

/// Returns the directory persisting deployment state, optionally scoped to a
/// deployment tag.
pub fn deployer_directory(tag: Option<&str>) -> PathBuf {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let base = PathBuf::from(base).join(".siem-deployer");
    match tag {
        Some(tag) => base.join(tag),
        None => base,
    }
}

/// Loads the shared AWS configuration, with the adaptive retry policy
/// applied to every client. Without an explicit region the default provider
/// chain (environment, profile) decides.
pub async fn load_aws_config(region: Option<String>) -> aws_config::SdkConfig {
    let retry = aws_config::retry::RetryConfig::adaptive()
        .with_max_attempts(5)
        .with_initial_backoff(std::time::Duration::from_millis(500))
        .with_max_backoff(std::time::Duration::from_secs(30));
    let mut loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).retry_config(retry);
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region));
    }
    loader.load().await
}

/// Reports whether a service error is a "not found" condition, which teardown
/// treats as already-deleted rather than a failure.
pub(crate) fn is_not_found<E: aws_smithy_types::error::metadata::ProvideErrorMetadata>(
    err: &E,
) -> bool {
    match err.code() {
        Some(code) => {
            code.contains("NotFound")
                || code == "NoSuchEntity"
                || code == "NoSuchHostedZone"
                || code == "ResourceNotFoundException"
        }
        None => false,
    }
}

/// Errors raised while composing or tearing down a deployment
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to build AWS request: {0}")]
    AwsBuild(#[from] aws_smithy_types::error::operation::BuildError),
    #[error("aws ec2 error: {0}")]
    AwsEc2(#[from] Box<aws_sdk_ec2::Error>),
    #[error("aws iam error: {0}")]
    AwsIam(#[from] Box<aws_sdk_iam::Error>),
    #[error("aws cloudwatch logs error: {0}")]
    AwsLogs(#[from] Box<aws_sdk_cloudwatchlogs::Error>),
    #[error("aws autoscaling error: {0}")]
    AwsAutoScaling(#[from] Box<aws_sdk_autoscaling::Error>),
    #[error("aws elb error: {0}")]
    AwsElb(#[from] Box<aws_sdk_elasticloadbalancingv2::Error>),
    #[error("aws acm error: {0}")]
    AwsAcm(#[from] Box<aws_sdk_acm::Error>),
    #[error("aws route53 error: {0}")]
    AwsRoute53(#[from] Box<aws_sdk_route53::Error>),
    #[error("{DEPLOYMENT_ENV_VAR} environment variable is not set")]
    EnvironmentNotSet,
    #[error("AWS region is not configured (set AWS_REGION or a profile region)")]
    RegionNotSet,
    #[error("environment '{0}' is not defined in the configuration")]
    UnknownEnvironment(String),
    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),
    #[error("subnet mask /{mask} does not fit in a /{vpc_prefix} VPC")]
    InvalidSubnetMask { mask: u8, vpc_prefix: u8 },
    #[error("address space exhausted allocating a /{mask} subnet from {cidr}")]
    SubnetSpaceExhausted { cidr: String, mask: u8 },
    #[error("capacity bounds violated: min {min} <= desired {desired} <= max {max} must hold")]
    InvalidCapacity { min: u32, desired: u32, max: u32 },
    #[error("sg_cidrs_list must contain at least one CIDR block")]
    EmptyCidrAllowList,
    #[error("hosted_zone_name must not be empty")]
    EmptyHostedZoneName,
    #[error("invalid instance type: {0}")]
    InvalidInstanceType(String),
    #[error("fewer than {AZ_COUNT} availability zones available in region")]
    NotEnoughAvailabilityZones,
    #[error("no available AMI matches name '{0}'")]
    AmiNotFound(String),
    #[error("hosted zone '{0}' does not exist in Route 53")]
    HostedZoneNotFound(String),
    #[error("certificate for '{0}' was not issued in time")]
    CertificateNotIssued(String),
    #[error("NAT gateway {0} did not become available in time")]
    NatGatewayNotAvailable(String),
    #[error("AWS response missing {0}")]
    MissingResponse(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("deployment '{0}' already exists; destroy it before re-creating")]
    CreationAttempted(String),
    #[error("deployment '{0}' was never fully created")]
    DeploymentNotComplete(String),
    #[error("deployment '{0}' is already destroyed")]
    DeploymentAlreadyDestroyed(String),
    #[error("no metadata found for deployment '{0}'")]
    DeploymentNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposed_ports_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for service in ports::EXPOSED {
            assert!(seen.insert(service.port), "duplicate port {}", service.port);
        }
        assert_eq!(ports::EXPOSED.len(), 5);
    }

    #[test]
    fn validate_accepts_well_formed_environment() {
        let env = Environment {
            networking: NetworkingConfig {
                vpc_name: "main-vpc".to_string(),
                vpc_cidr: "10.0.0.0/16".to_string(),
                enable_nat_gateway: true,
                public_subnet_mask: 24,
                private_subnet_mask: 20,
                enable_vpc_flow_logs: true,
                enable_vpc_endpoints: true,
            },
            siem: Some(SiemConfig {
                short_name: "wazuh".to_string(),
                sg_cidrs_list: vec!["1.2.3.4/32".to_string()],
                instance_type: "t3.large".to_string(),
                min_capacity: 1,
                max_capacity: 2,
                desired_capacity: 1,
                ami_name: "amzn2-ami-hvm-*".to_string(),
                hosted_zone_name: "example.com".to_string(),
                fleet_type: FleetType::Server,
                balancer: BalancerKind::Network,
            }),
        };
        env.validate().unwrap();
    }

    #[test]
    fn validate_rejects_capacity_inversion() {
        let mut env = Environment {
            networking: NetworkingConfig {
                vpc_name: "main-vpc".to_string(),
                vpc_cidr: "10.0.0.0/16".to_string(),
                enable_nat_gateway: false,
                public_subnet_mask: 24,
                private_subnet_mask: 20,
                enable_vpc_flow_logs: false,
                enable_vpc_endpoints: false,
            },
            siem: Some(SiemConfig {
                short_name: "wazuh".to_string(),
                sg_cidrs_list: vec!["1.2.3.4/32".to_string()],
                instance_type: "t3.large".to_string(),
                min_capacity: 3,
                max_capacity: 2,
                desired_capacity: 2,
                ami_name: "amzn2-ami-hvm-*".to_string(),
                hosted_zone_name: "example.com".to_string(),
                fleet_type: FleetType::Server,
                balancer: BalancerKind::Network,
            }),
        };
        assert!(matches!(
            env.validate(),
            Err(Error::InvalidCapacity { .. })
        ));

        // desired above max fails too
        let siem = env.siem.as_mut().unwrap();
        siem.min_capacity = 1;
        siem.desired_capacity = 5;
        assert!(matches!(env.validate(), Err(Error::InvalidCapacity { .. })));
    }

    #[test]
    fn validate_rejects_subnet_mask_wider_than_vpc() {
        let env = Environment {
            networking: NetworkingConfig {
                vpc_name: "main-vpc".to_string(),
                vpc_cidr: "10.0.0.0/24".to_string(),
                enable_nat_gateway: false,
                public_subnet_mask: 20,
                private_subnet_mask: 26,
                enable_vpc_flow_logs: false,
                enable_vpc_endpoints: false,
            },
            siem: None,
        };
        assert!(matches!(
            env.validate(),
            Err(Error::InvalidSubnetMask { mask: 20, .. })
        ));
    }

    #[test]
    fn fleet_type_rejects_unknown_variant() {
        let err = serde_yaml::from_str::<FleetType>("proxy");
        assert!(err.is_err());
        assert_eq!(
            serde_yaml::from_str::<FleetType>("agent").unwrap(),
            FleetType::Agent
        );
    }
}
