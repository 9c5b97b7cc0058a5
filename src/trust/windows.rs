// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use crate::fs::path_to_str;
use crate::trust::{run_command, validate_alias, PlatformTrust, StagedCertificate};
use rustls::pki_types::CertificateDer;

/// Installs into the current user's Trusted Root store. No elevation needed,
/// though Windows shows a confirmation dialog on first install.
pub struct CertStoreTrust;

impl PlatformTrust for CertStoreTrust {
    fn install_certificate(&self, alias: &str, certificate: &CertificateDer<'_>) -> Result<bool> {
        validate_alias(alias)?;
        let staged = StagedCertificate::write(certificate)?;
        let cert_path_str = path_to_str(staged.path())?;

        // certutil -verify succeeds once the chain ends in a trusted root
        let verify = run_command("certutil", &["-user", "-verify", cert_path_str])?;
        if verify.status.success() {
            tracing::debug!("certificate already trusted");
            return Ok(false);
        }

        let output = run_command(
            "certutil",
            &["-user", "-addstore", "-f", "Root", cert_path_str],
        )?;

        if !output.status.success() {
            return Err(Error::TrustStore(format!(
                "Failed to add certificate to Windows trust store: {}",
                String::from_utf8_lossy(&output.stdout).trim()
            )));
        }

        tracing::info!(alias, "certificate added to user Root store");
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "Windows Certificate Store"
    }
}
