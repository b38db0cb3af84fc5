//! Load balancer, target groups, and listeners for the SIEM fleet

use crate::aws::{is_not_found, ports, BalancerKind, Error, TAG_KEY};
use aws_sdk_elasticloadbalancingv2::{
    types::{
        Action, ActionTypeEnum, Certificate, LoadBalancerSchemeEnum, LoadBalancerTypeEnum,
        ProtocolEnum, Tag, TargetTypeEnum,
    },
    Client as ElbClient,
};
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Fixed health check applied to every target group
const HEALTH_CHECK_PATH: &str = "/";
const HEALTH_CHECK_TIMEOUT_SECONDS: i32 = 15;
const HEALTH_CHECK_INTERVAL_SECONDS: i32 = 300;

/// Maximum polling attempts while waiting for the balancer to disappear
const LB_POLL_ATTEMPTS: usize = 60;

/// Interval between polling attempts
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

fn sdk_err<E>(err: E) -> Error
where
    aws_sdk_elasticloadbalancingv2::Error: From<E>,
{
    Error::AwsElb(Box::new(err.into()))
}

/// A created load balancer, with the fields the DNS alias record needs
pub struct BalancerHandle {
    pub arn: String,
    pub dns_name: String,
    pub canonical_zone_id: String,
}

/// Name of the target group fronting a service
pub fn target_group_name(short_name: &str, service: &ports::Service) -> String {
    format!("{short_name}-{}", service.name)
}

/// Listener protocol for the balancer variant: TLS termination on every port
pub fn listener_protocol(kind: BalancerKind) -> ProtocolEnum {
    match kind {
        BalancerKind::Network => ProtocolEnum::Tls,
        BalancerKind::Application => ProtocolEnum::Https,
    }
}

/// Backend protocol spoken to the fleet for a given service
pub fn target_protocol(kind: BalancerKind, service: &ports::Service) -> ProtocolEnum {
    match kind {
        BalancerKind::Network => ProtocolEnum::Tcp,
        // The dashboard serves TLS itself; the remaining services are plain
        BalancerKind::Application if service.port == ports::DASHBOARD.port => ProtocolEnum::Https,
        BalancerKind::Application => ProtocolEnum::Http,
    }
}

/// Creates the internet-facing balancer in the public subnets
pub async fn create_load_balancer(
    client: &ElbClient,
    kind: BalancerKind,
    short_name: &str,
    subnet_ids: &[String],
    security_group_id: &str,
    tag: &str,
) -> Result<BalancerHandle, Error> {
    let lb_type = match kind {
        BalancerKind::Network => LoadBalancerTypeEnum::Network,
        BalancerKind::Application => LoadBalancerTypeEnum::Application,
    };
    let mut request = client
        .create_load_balancer()
        .name(short_name)
        .r#type(lb_type)
        .scheme(LoadBalancerSchemeEnum::InternetFacing)
        .security_groups(security_group_id)
        .tags(Tag::builder().key(TAG_KEY).value(tag).build()?)
        .tags(Tag::builder().key("Name").value(short_name).build()?);
    for subnet_id in subnet_ids {
        request = request.subnets(subnet_id);
    }
    let resp = request.send().await.map_err(sdk_err)?;
    let balancer = resp
        .load_balancers()
        .first()
        .ok_or(Error::MissingResponse("load balancer"))?;
    Ok(BalancerHandle {
        arn: balancer
            .load_balancer_arn()
            .ok_or(Error::MissingResponse("load balancer ARN"))?
            .to_string(),
        dns_name: balancer
            .dns_name()
            .ok_or(Error::MissingResponse("load balancer DNS name"))?
            .to_string(),
        canonical_zone_id: balancer
            .canonical_hosted_zone_id()
            .ok_or(Error::MissingResponse("load balancer hosted zone"))?
            .to_string(),
    })
}

/// Creates a target group for one service, with the fixed health check
pub async fn create_target_group(
    client: &ElbClient,
    kind: BalancerKind,
    short_name: &str,
    service: &ports::Service,
    vpc_id: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .create_target_group()
        .name(target_group_name(short_name, service))
        .protocol(target_protocol(kind, service))
        .port(service.port as i32)
        .vpc_id(vpc_id)
        .target_type(TargetTypeEnum::Instance)
        .health_check_protocol(ProtocolEnum::Http)
        .health_check_path(HEALTH_CHECK_PATH)
        .health_check_timeout_seconds(HEALTH_CHECK_TIMEOUT_SECONDS)
        .health_check_interval_seconds(HEALTH_CHECK_INTERVAL_SECONDS)
        .tags(Tag::builder().key(TAG_KEY).value(tag).build()?)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .target_groups()
        .first()
        .and_then(|tg| tg.target_group_arn())
        .ok_or(Error::MissingResponse("target group ARN"))?
        .to_string())
}

/// Creates a TLS-terminating listener forwarding one port to one target group
pub async fn create_listener(
    client: &ElbClient,
    kind: BalancerKind,
    balancer_arn: &str,
    service: &ports::Service,
    certificate_arn: &str,
    target_group_arn: &str,
) -> Result<String, Error> {
    let resp = client
        .create_listener()
        .load_balancer_arn(balancer_arn)
        .protocol(listener_protocol(kind))
        .port(service.port as i32)
        .certificates(
            Certificate::builder()
                .certificate_arn(certificate_arn)
                .build(),
        )
        .default_actions(
            Action::builder()
                .r#type(ActionTypeEnum::Forward)
                .target_group_arn(target_group_arn)
                .build()?,
        )
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .listeners()
        .first()
        .and_then(|listener| listener.listener_arn())
        .ok_or(Error::MissingResponse("listener ARN"))?
        .to_string())
}

/// Finds the balancer by name, if it still exists
pub async fn find_load_balancer(
    client: &ElbClient,
    short_name: &str,
) -> Result<Option<BalancerHandle>, Error> {
    let resp = match client
        .describe_load_balancers()
        .names(short_name)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            let err = aws_sdk_elasticloadbalancingv2::Error::from(err);
            if is_not_found(&err) {
                return Ok(None);
            }
            return Err(Error::AwsElb(Box::new(err)));
        }
    };
    Ok(resp.load_balancers().first().and_then(|balancer| {
        Some(BalancerHandle {
            arn: balancer.load_balancer_arn()?.to_string(),
            dns_name: balancer.dns_name()?.to_string(),
            canonical_zone_id: balancer.canonical_hosted_zone_id()?.to_string(),
        })
    }))
}

/// Deletes the balancer's listeners, the balancer itself (waiting for it to
/// disappear), and the per-service target groups
pub async fn delete_load_balancer_stack(
    client: &ElbClient,
    short_name: &str,
) -> Result<(), Error> {
    if let Some(balancer) = find_load_balancer(client, short_name).await? {
        let listeners = client
            .describe_listeners()
            .load_balancer_arn(&balancer.arn)
            .send()
            .await
            .map_err(sdk_err)?;
        for listener in listeners.listeners() {
            if let Some(listener_arn) = listener.listener_arn() {
                client
                    .delete_listener()
                    .listener_arn(listener_arn)
                    .send()
                    .await
                    .map_err(sdk_err)?;
            }
        }
        client
            .delete_load_balancer()
            .load_balancer_arn(&balancer.arn)
            .send()
            .await
            .map_err(sdk_err)?;
        for _ in 0..LB_POLL_ATTEMPTS {
            if find_load_balancer(client, short_name).await?.is_none() {
                break;
            }
            sleep(RETRY_INTERVAL).await;
        }
    } else {
        debug!(balancer = short_name, "load balancer already deleted");
    }

    for service in &ports::EXPOSED {
        let name = target_group_name(short_name, service);
        let resp = match client.describe_target_groups().names(&name).send().await {
            Ok(resp) => resp,
            Err(err) => {
                let err = aws_sdk_elasticloadbalancingv2::Error::from(err);
                if is_not_found(&err) {
                    continue;
                }
                return Err(Error::AwsElb(Box::new(err)));
            }
        };
        for target_group in resp.target_groups() {
            if let Some(target_group_arn) = target_group.target_group_arn() {
                client
                    .delete_target_group()
                    .target_group_arn(target_group_arn)
                    .send()
                    .await
                    .map_err(sdk_err)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_terminates_tls_on_both_variants() {
        assert_eq!(listener_protocol(BalancerKind::Network), ProtocolEnum::Tls);
        assert_eq!(
            listener_protocol(BalancerKind::Application),
            ProtocolEnum::Https
        );
    }

    #[test]
    fn backend_protocol_follows_the_variant() {
        for service in &ports::EXPOSED {
            assert_eq!(
                target_protocol(BalancerKind::Network, service),
                ProtocolEnum::Tcp
            );
        }
        assert_eq!(
            target_protocol(BalancerKind::Application, &ports::DASHBOARD),
            ProtocolEnum::Https
        );
        assert_eq!(
            target_protocol(BalancerKind::Application, &ports::INDEXER),
            ProtocolEnum::Http
        );
    }

    #[test]
    fn target_group_names_stay_within_the_32_char_limit() {
        for service in &ports::EXPOSED {
            let name = target_group_name("wazuh-prod", service);
            assert!(name.len() <= 32, "{name}");
        }
    }
}
