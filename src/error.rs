// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed input '{input}': {reason}")]
    MalformedInput { input: String, reason: String },

    #[error("Keystore {path} is unreadable: {reason}\nRemove it manually to provision a new identity (installed trust will be lost).")]
    KeystoreCorrupt { path: PathBuf, reason: String },

    #[error("TLS initialization failed: {0}")]
    TlsInit(String),

    #[error("Failed to bind to {addr}: {source}\nIs another process using this port?")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Listener already running on {addr}. Stop it before starting another.")]
    AlreadyRunning { addr: SocketAddr },

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Certificate generation failed: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("Failed to parse certificate: {0}")]
    CertParse(String),

    #[error("Invalid validity period: {0}")]
    InvalidDays(String),

    #[error("Key generation failed: {0}")]
    KeyGen(String),

    #[error("Key encryption failed: {0}")]
    KeyEncryption(String),

    #[error("Invalid host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret store error: {0}")]
    SecretStore(String),

    #[error("Trust store operation failed: {0}")]
    TrustStore(String),

    #[error("Command failed: {command}\n{stderr}")]
    Command { command: String, stderr: String },

    #[error("Invalid path (non-UTF8): {0}")]
    InvalidPath(PathBuf),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    /// True for port conflicts, which callers treat as a retryable warning.
    pub fn is_bind_conflict(&self) -> bool {
        matches!(
            self,
            Error::BindFailed { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }

    pub(crate) fn malformed(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedInput {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::KeystoreCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
