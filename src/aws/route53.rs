//! Route 53 hosted-zone lookup and record management

use crate::aws::{Error, DNS_SUBDOMAIN};
use aws_sdk_route53::{
    types::{
        AliasTarget, Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
    },
    Client as Route53Client,
};

/// TTL for validation CNAME records
const VALIDATION_RECORD_TTL: i64 = 300;

fn sdk_err<E>(err: E) -> Error
where
    aws_sdk_route53::Error: From<E>,
{
    Error::AwsRoute53(Box::new(err.into()))
}

/// Computes the service domain published in front of a hosted zone
pub fn service_domain(hosted_zone_name: &str) -> String {
    format!("{DNS_SUBDOMAIN}.{}", hosted_zone_name.trim_end_matches('.'))
}

/// Resolves a pre-existing hosted zone by name and returns its id.
///
/// Zones are never created here; a missing zone is a fatal error.
pub async fn find_hosted_zone(
    client: &Route53Client,
    hosted_zone_name: &str,
) -> Result<String, Error> {
    let wanted = hosted_zone_name.trim_end_matches('.');
    let resp = client
        .list_hosted_zones_by_name()
        .dns_name(wanted)
        .max_items(1)
        .send()
        .await
        .map_err(sdk_err)?;
    let zone = resp
        .hosted_zones()
        .iter()
        .find(|zone| zone.name().trim_end_matches('.') == wanted)
        .ok_or_else(|| Error::HostedZoneNotFound(hosted_zone_name.to_string()))?;
    // Zone ids are returned as "/hostedzone/<id>"
    Ok(zone
        .id()
        .trim_start_matches("/hostedzone/")
        .to_string())
}

async fn change_record(
    client: &Route53Client,
    hosted_zone_id: &str,
    action: ChangeAction,
    record_set: ResourceRecordSet,
) -> Result<(), Error> {
    client
        .change_resource_record_sets()
        .hosted_zone_id(hosted_zone_id)
        .change_batch(
            ChangeBatch::builder()
                .changes(
                    Change::builder()
                        .action(action)
                        .resource_record_set(record_set)
                        .build()?,
                )
                .build()?,
        )
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(())
}

fn validation_record_set(name: &str, value: &str) -> Result<ResourceRecordSet, Error> {
    Ok(ResourceRecordSet::builder()
        .name(name)
        .r#type(RrType::Cname)
        .ttl(VALIDATION_RECORD_TTL)
        .resource_records(ResourceRecord::builder().value(value).build()?)
        .build()?)
}

fn alias_record_set(
    domain: &str,
    balancer_dns_name: &str,
    balancer_zone_id: &str,
) -> Result<ResourceRecordSet, Error> {
    Ok(ResourceRecordSet::builder()
        .name(domain)
        .r#type(RrType::A)
        .alias_target(
            AliasTarget::builder()
                .hosted_zone_id(balancer_zone_id)
                .dns_name(balancer_dns_name)
                .evaluate_target_health(false)
                .build()?,
        )
        .build()?)
}

/// Upserts the certificate validation CNAME into the zone
pub async fn upsert_validation_record(
    client: &Route53Client,
    hosted_zone_id: &str,
    name: &str,
    value: &str,
) -> Result<(), Error> {
    change_record(
        client,
        hosted_zone_id,
        ChangeAction::Upsert,
        validation_record_set(name, value)?,
    )
    .await
}

/// Upserts the alias A record pointing the service domain at the balancer
pub async fn upsert_alias_record(
    client: &Route53Client,
    hosted_zone_id: &str,
    domain: &str,
    balancer_dns_name: &str,
    balancer_zone_id: &str,
) -> Result<(), Error> {
    change_record(
        client,
        hosted_zone_id,
        ChangeAction::Upsert,
        alias_record_set(domain, balancer_dns_name, balancer_zone_id)?,
    )
    .await
}

/// Deletes a record by name and type, tolerating a record that no longer
/// exists. The delete change must carry the record's exact current data, so
/// the record is looked up first.
pub async fn delete_record(
    client: &Route53Client,
    hosted_zone_id: &str,
    name: &str,
    record_type: RrType,
) -> Result<(), Error> {
    let resp = client
        .list_resource_record_sets()
        .hosted_zone_id(hosted_zone_id)
        .start_record_name(name)
        .start_record_type(record_type.clone())
        .max_items(1)
        .send()
        .await
        .map_err(sdk_err)?;
    let Some(record_set) = resp
        .resource_record_sets()
        .iter()
        .find(|record_set| {
            record_set.name().trim_end_matches('.') == name.trim_end_matches('.')
                && *record_set.r#type() == record_type
        })
        .cloned()
    else {
        return Ok(());
    };
    change_record(client, hosted_zone_id, ChangeAction::Delete, record_set).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_domain_prefixes_the_zone() {
        assert_eq!(service_domain("example.com"), "siem.example.com");
        // API-style zone names carry a trailing dot
        assert_eq!(service_domain("example.com."), "siem.example.com");
    }
}
