//! Cluster certificate authority.
//!
//! A self-signed CA that signs the TLS certificate of every node that
//! completes a join. The node sends a PKCS#10 request as its public TLS key;
//! the CA keeps only the request's public key and decides the subject, SANs
//! and validity itself.

use std::net::IpAddr;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose,
    SanType,
};
use time::OffsetDateTime;
use tracing::info;

use crate::error::JoinError;
use crate::issuer::{CertIssuer, IssueRequest};
use crate::messages::JoinResult;

/// A certificate and private key, both PEM-encoded.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// The CA that issues node certificates for one cluster.
pub struct ClusterCa {
    cluster_name: String,
    cert: Certificate,
    key: KeyPair,
}

impl ClusterCa {
    /// Generate a fresh self-signed CA for `cluster_name`.
    pub fn generate(cluster_name: &str) -> anyhow::Result<Self> {
        let key = KeyPair::generate()?;
        let cert = ca_params(cluster_name).self_signed(&key)?;

        info!(cluster = %cluster_name, "generated cluster CA certificate");

        Ok(Self {
            cluster_name: cluster_name.to_string(),
            cert,
            key,
        })
    }

    /// Load a CA previously saved with [`ClusterCa::export`].
    pub fn from_pem(cluster_name: &str, cert_pem: &str, key_pem: &str) -> anyhow::Result<Self> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        if !matches!(params.is_ca, IsCa::Ca(_)) {
            anyhow::bail!("certificate is not a CA certificate");
        }
        // Re-signing keeps the subject and key, so certificates issued by
        // either copy chain to the same trust anchor.
        let cert = params.self_signed(&key)?;

        Ok(Self {
            cluster_name: cluster_name.to_string(),
            cert,
            key,
        })
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// The CA certificate nodes should trust.
    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn export(&self) -> CertKeyPair {
        CertKeyPair {
            cert_pem: self.cert.pem(),
            key_pem: self.key.serialize_pem(),
        }
    }

    /// Sign the node's certificate request.
    fn sign(
        &self,
        csr_pem: &str,
        host_id: &str,
        req: &IssueRequest<'_>,
    ) -> Result<Certificate, JoinError> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| {
            JoinError::InvalidRequest(format!("public TLS key is not a certificate request: {e}"))
        })?;

        let init = req.init;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, self.cluster_name.as_str());
        if !init.role.is_empty() {
            dn.push(DnType::OrganizationalUnitName, init.role.as_str());
        }
        dn.push(DnType::CommonName, host_id);

        let params = &mut csr.params;
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_before = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        params.not_after = OffsetDateTime::from(req.not_after);
        params.subject_alt_names = subject_alt_names(
            std::iter::once(host_id)
                .chain(std::iter::once(init.node_name.as_str()))
                .chain(init.dns_names.iter().map(String::as_str))
                .chain(init.additional_principals.iter().map(String::as_str)),
        )?;

        csr.signed_by(&self.cert, &self.key)
            .map_err(|e| JoinError::Issuance(format!("signing node certificate: {e}")))
    }
}

#[async_trait]
impl CertIssuer for ClusterCa {
    async fn issue(&self, req: &IssueRequest<'_>) -> Result<JoinResult, JoinError> {
        let init = req.init;
        if init.public_tls_key.is_empty() {
            return Err(JoinError::InvalidRequest(
                "node sent no public TLS key".to_string(),
            ));
        }
        let csr_pem = std::str::from_utf8(&init.public_tls_key).map_err(|_| {
            JoinError::InvalidRequest("public TLS key is not PEM text".to_string())
        })?;

        let host_id = new_host_id()?;
        let cert = self.sign(csr_pem, &host_id, req)?;

        info!(
            %host_id,
            node = %init.node_name,
            role = %init.role,
            "issued node certificate"
        );

        Ok(JoinResult {
            tls_cert: cert.pem().into_bytes(),
            tls_ca_certs: vec![self.cert.pem().into_bytes()],
            // Node SSH certificates are not issued by this CA.
            ssh_cert: Vec::new(),
            ssh_ca_keys: Vec::new(),
            host_id,
        })
    }
}

fn ca_params(cluster_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, cluster_name);
    dn.push(DnType::CommonName, format!("{cluster_name} cluster CA"));
    params.distinguished_name = dn;

    // Valid for 10 years.
    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(1);
    params.not_after = now + time::Duration::days(3650);
    params
}

/// SANs for `names`: IPs become IP SANs, everything else a DNS name.
/// Empty and repeated names are skipped.
fn subject_alt_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<Vec<SanType>, JoinError> {
    let mut sans: Vec<SanType> = Vec::new();
    for name in names.filter(|n| !n.is_empty()) {
        let san = if let Ok(ip) = name.parse::<IpAddr>() {
            SanType::IpAddress(ip)
        } else {
            let dns = Ia5String::try_from(name).map_err(|_| {
                JoinError::InvalidRequest(format!("{name:?} is not a valid DNS name"))
            })?;
            SanType::DnsName(dns)
        };
        if !sans.contains(&san) {
            sans.push(san);
        }
    }
    Ok(sans)
}

/// A random 128-bit host ID, hex-encoded.
fn new_host_id() -> Result<String, JoinError> {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf)
        .map_err(|e| JoinError::Issuance(format!("generating host id: {e}")))?;
    Ok(hex::encode(buf))
}
