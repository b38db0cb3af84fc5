//! ACM certificate issuance, validated through Route 53 DNS records

use crate::aws::{is_not_found, Error, TAG_KEY};
use aws_sdk_acm::{
    types::{CertificateStatus, Tag, ValidationMethod},
    Client as AcmClient,
};
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Maximum polling attempts while waiting for the validation record
const RECORD_POLL_ATTEMPTS: usize = 30;

/// Maximum polling attempts while waiting for issuance (DNS propagation can
/// take several minutes)
const ISSUE_POLL_ATTEMPTS: usize = 120;

/// Interval between polling attempts
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

fn sdk_err<E>(err: E) -> Error
where
    aws_sdk_acm::Error: From<E>,
{
    Error::AwsAcm(Box::new(err.into()))
}

/// Requests a DNS-validated certificate for the domain and returns its ARN
pub async fn request_certificate(
    client: &AcmClient,
    domain: &str,
    tag: &str,
) -> Result<String, Error> {
    let resp = client
        .request_certificate()
        .domain_name(domain)
        .validation_method(ValidationMethod::Dns)
        .tags(Tag::builder().key(TAG_KEY).value(tag).build()?)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .certificate_arn()
        .ok_or(Error::MissingResponse("certificate ARN"))?
        .to_string())
}

/// Polls the certificate until ACM publishes the DNS validation record,
/// returning its (name, value) pair
pub async fn wait_for_validation_record(
    client: &AcmClient,
    certificate_arn: &str,
) -> Result<(String, String), Error> {
    for _ in 0..RECORD_POLL_ATTEMPTS {
        let resp = client
            .describe_certificate()
            .certificate_arn(certificate_arn)
            .send()
            .await
            .map_err(sdk_err)?;
        let record = resp
            .certificate()
            .and_then(|certificate| certificate.domain_validation_options().first())
            .and_then(|validation| validation.resource_record());
        if let Some(record) = record {
            return Ok((record.name().to_string(), record.value().to_string()));
        }
        sleep(RETRY_INTERVAL).await;
    }
    Err(Error::Timeout("certificate validation record"))
}

/// Polls the certificate until it is issued
pub async fn wait_for_issued(
    client: &AcmClient,
    certificate_arn: &str,
    domain: &str,
) -> Result<(), Error> {
    for _ in 0..ISSUE_POLL_ATTEMPTS {
        let resp = client
            .describe_certificate()
            .certificate_arn(certificate_arn)
            .send()
            .await
            .map_err(sdk_err)?;
        match resp.certificate().and_then(|certificate| certificate.status()) {
            Some(CertificateStatus::Issued) => return Ok(()),
            Some(CertificateStatus::Failed) | Some(CertificateStatus::ValidationTimedOut) => {
                return Err(Error::CertificateNotIssued(domain.to_string()))
            }
            _ => sleep(RETRY_INTERVAL).await,
        }
    }
    Err(Error::CertificateNotIssued(domain.to_string()))
}

/// Finds a certificate by its domain name, if one exists
pub async fn find_certificate_by_domain(
    client: &AcmClient,
    domain: &str,
) -> Result<Option<String>, Error> {
    let resp = client
        .list_certificates()
        .max_items(1000)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .certificate_summary_list()
        .iter()
        .find(|summary| summary.domain_name() == Some(domain))
        .and_then(|summary| summary.certificate_arn())
        .map(String::from))
}

/// Returns the certificate's validation record, if ACM still reports one
pub async fn validation_record(
    client: &AcmClient,
    certificate_arn: &str,
) -> Result<Option<(String, String)>, Error> {
    let resp = client
        .describe_certificate()
        .certificate_arn(certificate_arn)
        .send()
        .await
        .map_err(sdk_err)?;
    Ok(resp
        .certificate()
        .and_then(|certificate| certificate.domain_validation_options().first())
        .and_then(|validation| validation.resource_record())
        .map(|record| (record.name().to_string(), record.value().to_string())))
}

/// Deletes the certificate, tolerating absence and retrying while deleted
/// listeners release their reference to it
pub async fn delete_certificate(client: &AcmClient, certificate_arn: &str) -> Result<(), Error> {
    for _ in 0..RECORD_POLL_ATTEMPTS {
        match client
            .delete_certificate()
            .certificate_arn(certificate_arn)
            .send()
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) => {
                let err = aws_sdk_acm::Error::from(err);
                if is_not_found(&err) {
                    debug!(certificate = certificate_arn, "certificate already deleted");
                    return Ok(());
                }
                if matches!(
                    aws_smithy_types::error::metadata::ProvideErrorMetadata::code(&err),
                    Some("ResourceInUseException")
                ) {
                    sleep(RETRY_INTERVAL).await;
                    continue;
                }
                return Err(Error::AwsAcm(Box::new(err)));
            }
        }
    }
    Err(Error::Timeout("certificate release"))
}
