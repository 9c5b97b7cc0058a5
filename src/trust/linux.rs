// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::Result;
use crate::trust::{nss, validate_alias, validate_env_path, PlatformTrust, StagedCertificate};
use rustls::pki_types::CertificateDer;
use std::path::PathBuf;

/// Installs into the current user's NSS databases.
///
/// The system bundle needs root and would trust the certificate for every
/// user, so it is left alone.
pub struct NssTrust;

impl PlatformTrust for NssTrust {
    fn install_certificate(&self, alias: &str, certificate: &CertificateDer<'_>) -> Result<bool> {
        validate_alias(alias)?;

        let Some(home) = validate_env_path("HOME") else {
            tracing::debug!("HOME is unset or unsafe, skipping NSS databases");
            return Ok(false);
        };

        let databases = nss::find_nss_databases(&home, &firefox_roots(&home));
        if databases.is_empty() {
            tracing::debug!("no NSS databases found");
            return Ok(false);
        }

        let staged = StagedCertificate::write(certificate)?;
        Ok(nss::install(
            &databases,
            alias,
            staged.path(),
            certificate.as_ref(),
        ))
    }

    fn name(&self) -> &'static str {
        "NSS (Firefox/Chromium)"
    }
}

/// Native, Snap and Flatpak Firefox profile roots.
fn firefox_roots(home: &std::path::Path) -> Vec<PathBuf> {
    vec![
        home.join(".mozilla").join("firefox"),
        home.join("snap")
            .join("firefox")
            .join("common")
            .join(".mozilla")
            .join("firefox"),
        home.join(".var")
            .join("app")
            .join("org.mozilla.firefox")
            .join(".mozilla")
            .join("firefox"),
    ]
}
