// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! NSS databases used by Firefox and Chromium on Unix desktops.

use crate::trust::{is_command_available, is_safe_path, run_command};
use std::path::{Path, PathBuf};

/// Trust flags for a server certificate accepted as its own anchor.
const NSS_TRUST_FLAGS: &str = "P,,";

/// Find NSS databases below `home`.
///
/// `firefox_roots` are the directories holding Firefox profiles on this platform.
pub(super) fn find_nss_databases(home: &Path, firefox_roots: &[PathBuf]) -> Vec<(PathBuf, String)> {
    let mut databases = Vec::new();

    // Chrome/Chromium NSS database
    let chrome_nss = home.join(".pki").join("nssdb");
    if chrome_nss.join("cert9.db").exists() {
        databases.push((chrome_nss, "Chrome/Chromium".to_string()));
    }

    for firefox_dir in firefox_roots {
        let Ok(entries) = std::fs::read_dir(firefox_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            // Profiles look like "xyz.default" or "xyz.default-release"
            if name.contains(".default") && path.join("cert9.db").exists() {
                databases.push((path, format!("Firefox ({})", name)));
            }
        }
    }

    databases
}

/// Add the certificate to every database that does not already hold it.
/// Returns true when at least one database changed. Per-database failures
/// are logged and skipped.
pub(super) fn install(
    databases: &[(PathBuf, String)],
    alias: &str,
    cert_path: &Path,
    der: &[u8],
) -> bool {
    if databases.is_empty() {
        return false;
    }
    if !is_command_available("certutil") {
        tracing::debug!("certutil not found, skipping browser trust stores");
        return false;
    }
    let Some(cert_path_str) = cert_path.to_str() else {
        return false;
    };

    let mut changed = false;
    for (db_path, display_name) in databases {
        if !is_safe_path(db_path) {
            continue;
        }
        let Some(db_path_str) = db_path.to_str() else {
            continue;
        };
        let nss_db = format!("sql:{}", db_path_str);

        // -r prints the stored certificate as raw DER
        if let Ok(existing) = run_command("certutil", &["-d", &nss_db, "-L", "-n", alias, "-r"]) {
            if existing.status.success() && existing.stdout == der {
                tracing::debug!(store = %display_name, "certificate already trusted");
                continue;
            }
        }

        // Replace a stale entry with the same nickname
        let _ = run_command("certutil", &["-d", &nss_db, "-D", "-n", alias]);

        match run_command(
            "certutil",
            &[
                "-d",
                &nss_db,
                "-A",
                "-t",
                NSS_TRUST_FLAGS,
                "-n",
                alias,
                "-i",
                cert_path_str,
            ],
        ) {
            Ok(o) if o.status.success() => {
                tracing::info!(store = %display_name, "certificate added");
                changed = true;
            }
            Ok(o) => tracing::warn!(
                store = %display_name,
                stderr = %String::from_utf8_lossy(&o.stderr).trim(),
                "certutil rejected certificate"
            ),
            Err(e) => tracing::warn!(store = %display_name, error = %e, "certutil failed"),
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_nss_databases() {
        let home = tempfile::tempdir().unwrap();
        let chrome = home.path().join(".pki").join("nssdb");
        std::fs::create_dir_all(&chrome).unwrap();
        std::fs::write(chrome.join("cert9.db"), b"").unwrap();

        let firefox = home.path().join("firefox");
        let profile = firefox.join("abcd.default-release");
        std::fs::create_dir_all(&profile).unwrap();
        std::fs::write(profile.join("cert9.db"), b"").unwrap();
        std::fs::create_dir_all(firefox.join("other-profile")).unwrap();

        let found = find_nss_databases(home.path(), &[firefox, home.path().join("missing")]);
        let names: Vec<_> = found.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["Chrome/Chromium", "Firefox (abcd.default-release)"]);
    }

    #[test]
    fn test_install_without_databases_is_unchanged() {
        assert!(!install(&[], "alias", Path::new("/tmp/x.crt"), &[]));
    }
}
