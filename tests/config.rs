//! Configuration-contract tests: every required key must be present, bounds
//! must hold, and unknown keys or variants must be rejected.

use siem_deployer::aws::{BalancerKind, Config, Error, FleetType};
use std::path::PathBuf;

const FULL_CONFIG: &str = r#"
name: networking
environments:
  dev:
    networking:
      vpc_name: dev-vpc
      vpc_cidr: 10.0.0.0/16
      enable_nat_gateway: false
      public_subnet_mask: 24
      private_subnet_mask: 20
      enable_vpc_flow_logs: false
      enable_vpc_endpoints: false
  prod:
    networking:
      vpc_name: prod-vpc
      vpc_cidr: 10.1.0.0/16
      enable_nat_gateway: true
      public_subnet_mask: 24
      private_subnet_mask: 20
      enable_vpc_flow_logs: true
      enable_vpc_endpoints: true
    siem:
      short_name: wazuh
      sg_cidrs_list:
        - 1.2.3.4/32
        - 198.51.100.0/24
      instance_type: t3.large
      min_capacity: 1
      max_capacity: 3
      desired_capacity: 2
      ami_name: "amzn2-ami-hvm-*-x86_64-gp2"
      hosted_zone_name: example.com
"#;

fn write_config(test_name: &str, content: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("siem_deployer_test_{test_name}"));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.yaml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn loads_a_full_configuration() {
    let path = write_config("full", FULL_CONFIG);
    let config = Config::load(&path).unwrap();
    assert_eq!(config.name, "networking");
    assert_eq!(config.environments.len(), 2);

    let dev = config.environment("dev").unwrap();
    assert!(dev.siem.is_none());
    dev.validate().unwrap();

    let prod = config.environment("prod").unwrap();
    let siem = prod.siem.as_ref().unwrap();
    assert_eq!(siem.short_name, "wazuh");
    assert_eq!(siem.sg_cidrs_list.len(), 2);
    // Optional selectors fall back to their defaults
    assert_eq!(siem.fleet_type, FleetType::Server);
    assert_eq!(siem.balancer, BalancerKind::Network);
    prod.validate().unwrap();
}

#[test]
fn missing_required_key_fails_deserialization() {
    let without_cidr = FULL_CONFIG.replace("      vpc_cidr: 10.0.0.0/16\n", "");
    let path = write_config("missing_key", &without_cidr);
    assert!(matches!(Config::load(&path), Err(Error::Yaml(_))));
}

#[test]
fn unknown_key_fails_deserialization() {
    let with_extra = FULL_CONFIG.replace(
        "      vpc_name: dev-vpc\n",
        "      vpc_name: dev-vpc\n      vpc_tenancy: dedicated\n",
    );
    let path = write_config("unknown_key", &with_extra);
    assert!(matches!(Config::load(&path), Err(Error::Yaml(_))));
}

#[test]
fn unknown_fleet_type_fails_deserialization() {
    let with_fleet = FULL_CONFIG.replace(
        "      hosted_zone_name: example.com\n",
        "      hosted_zone_name: example.com\n      fleet_type: proxy\n",
    );
    let path = write_config("unknown_fleet", &with_fleet);
    assert!(matches!(Config::load(&path), Err(Error::Yaml(_))));
}

#[test]
fn explicit_selectors_override_the_defaults() {
    let with_selectors = FULL_CONFIG.replace(
        "      hosted_zone_name: example.com\n",
        "      hosted_zone_name: example.com\n      fleet_type: agent\n      balancer: application\n",
    );
    let path = write_config("selectors", &with_selectors);
    let config = Config::load(&path).unwrap();
    let siem = config.environment("prod").unwrap().siem.as_ref().unwrap();
    assert_eq!(siem.fleet_type, FleetType::Agent);
    assert_eq!(siem.balancer, BalancerKind::Application);
}

#[test]
fn unknown_environment_is_an_error() {
    let path = write_config("unknown_env", FULL_CONFIG);
    let config = Config::load(&path).unwrap();
    assert!(matches!(
        config.environment("staging"),
        Err(Error::UnknownEnvironment(name)) if name == "staging"
    ));
}

#[test]
fn capacity_bounds_are_enforced_before_any_aws_call() {
    let inverted = FULL_CONFIG
        .replace("      min_capacity: 1\n", "      min_capacity: 3\n")
        .replace("      desired_capacity: 2\n", "      desired_capacity: 1\n");
    let path = write_config("capacity", &inverted);
    let config = Config::load(&path).unwrap();
    assert!(matches!(
        config.environment("prod").unwrap().validate(),
        Err(Error::InvalidCapacity {
            min: 3,
            desired: 1,
            max: 3
        })
    ));
}

#[test]
fn malformed_allow_list_entry_is_rejected() {
    let bad_cidr = FULL_CONFIG.replace("        - 1.2.3.4/32\n", "        - 1.2.3.4\n");
    let path = write_config("bad_cidr", &bad_cidr);
    let config = Config::load(&path).unwrap();
    assert!(matches!(
        config.environment("prod").unwrap().validate(),
        Err(Error::InvalidCidr(_))
    ));
}
