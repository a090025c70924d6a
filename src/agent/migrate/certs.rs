use std::{fs::Permissions, os::unix::fs::PermissionsExt, path::Path};

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::constants::MIGRATE_TLS_HOSTNAME;

const TTL_HOURS: i64 = 24;

/// x509 material for one migration channel, in the file layout the
/// hypervisor's TLS credentials expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateCerts {
    pub ca_cert: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
}

impl MigrateCerts {
    /// Issues a throwaway CA and a server and client certificate signed by
    /// it. The server certificate is issued for [`MIGRATE_TLS_HOSTNAME`].
    pub fn generate() -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        let not_before = now - Duration::minutes(1);
        let not_after = now + Duration::hours(TTL_HOURS);

        let ca_key = KeyPair::generate()?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.distinguished_name = name("keel migration ca");
        ca_params.not_before = not_before;
        ca_params.not_after = not_after;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = ca_params.self_signed(&ca_key)?;
        let issuer = Issuer::new(ca_params, ca_key);

        let server_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![MIGRATE_TLS_HOSTNAME.to_string()])?;
        params.distinguished_name = name(MIGRATE_TLS_HOSTNAME);
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = params.signed_by(&server_key, &issuer)?;

        let client_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = name("keel migration client");
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = params.signed_by(&client_key, &issuer)?;

        Ok(Self {
            ca_cert: ca_cert.pem(),
            server_cert: server_cert.pem(),
            server_key: server_key.serialize_pem(),
            client_cert: client_cert.pem(),
            client_key: client_key.serialize_pem(),
        })
    }

    fn files(&self) -> [(&'static str, &str); 5] {
        [
            ("ca-cert.pem", &self.ca_cert),
            ("server-cert.pem", &self.server_cert),
            ("server-key.pem", &self.server_key),
            ("client-cert.pem", &self.client_cert),
            ("client-key.pem", &self.client_key),
        ]
    }

    pub async fn write(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;

        for (name, pem) in self.files() {
            let path = dir.join(name);
            tokio::fs::write(&path, pem)
                .await
                .with_context(|| format!("write {}", path.display()))?;

            if name.ends_with("-key.pem") {
                tokio::fs::set_permissions(&path, Permissions::from_mode(0o600)).await?;
            }
        }
        Ok(())
    }

    pub async fn read(dir: &Path) -> Result<Self> {
        let read = |name: &'static str| {
            let path = dir.join(name);
            async move {
                tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("read {}", path.display()))
            }
        };

        Ok(Self {
            ca_cert: read("ca-cert.pem").await?,
            server_cert: read("server-cert.pem").await?,
            server_key: read("server-key.pem").await?,
            client_cert: read("client-cert.pem").await?,
            client_key: read("client-key.pem").await?,
        })
    }
}

fn name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}
