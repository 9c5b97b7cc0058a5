// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand};
use remote_tls::{
    platform_trust, CertInfo, Config, Error, FileSecretStore, Keystore, KeystoreProvisioner,
    Paths, RemoteControlServer, Result, SecretStore, StatusDispatcher, TlsContext, ENTRY_ALIAS,
};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How long `status --probe` waits for the listener.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "remote-tls")]
#[command(about = "Loopback HTTPS listener with a self-provisioned certificate")]
#[command(version)]
#[command(after_help = "\
EXAMPLES:
    remote-tls init                # Generate the keystore if missing
    remote-tls trust               # Install the certificate for local browsers
    remote-tls serve               # Listen on the configured port
    remote-tls status --probe      # Check a running listener

Set REMOTE_TLS_ROOT to use a different data directory.")]
struct Cli {
    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log debug details
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the keystore and certificate (no-op when present)
    Init,

    /// Show configuration, keystore and certificate details
    Status {
        /// Also perform a TLS handshake against the running listener
        #[arg(long)]
        probe: bool,
    },

    /// Install the certificate into the platform trust stores
    Trust,

    /// Run the listener until Ctrl+C
    Serve {
        /// Port to listen on (defaults to the configured port)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        port: Option<u16>,

        /// Do not touch trust stores on start
        #[arg(long)]
        skip_trust: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let paths = Paths::new()?;
    let config = Config::load(&paths.config)?;

    match cli.command {
        Commands::Init => cmd_init(&paths, &config),
        Commands::Status { probe } => cmd_status(&paths, &config, probe),
        Commands::Trust => cmd_trust(&paths, &config),
        Commands::Serve { port, skip_trust } => {
            cmd_serve(paths, &config, port.unwrap_or(config.https.port), skip_trust)
        }
    }
}

fn open_secrets(paths: &Paths) -> Result<Arc<FileSecretStore>> {
    Ok(Arc::new(FileSecretStore::open(&paths.preferences)?))
}

fn open_keystore(paths: &Paths, config: &Config) -> Result<(KeystoreProvisioner, Keystore)> {
    if !paths.keystore_exists() {
        return Err(Error::Config(format!(
            "No keystore at {}. Run 'remote-tls init' first.",
            paths.keystore.display()
        )));
    }
    let secrets: Arc<dyn SecretStore> = open_secrets(paths)?;
    let provisioner = KeystoreProvisioner::new(secrets, config.https.port);
    let keystore = provisioner.load_keystore(&paths.keystore)?;
    Ok((provisioner, keystore))
}

fn cmd_init(paths: &Paths, config: &Config) -> Result<()> {
    paths.ensure_dir()?;
    let secrets: Arc<dyn SecretStore> = open_secrets(paths)?;
    let provisioner = KeystoreProvisioner::new(secrets, config.https.port);

    let handle = provisioner.ensure_keystore(&paths.keystore)?;
    if handle.created {
        println!("Created keystore: {}", handle.path.display());
    } else {
        println!("Keystore already exists: {}", handle.path.display());
    }

    let keystore = provisioner.load_keystore(&handle.path)?;
    println!();
    print_certificate(&keystore, &keystore.certificate_info()?);
    Ok(())
}

fn cmd_status(paths: &Paths, config: &Config, probe: bool) -> Result<()> {
    println!("remote-tls status");
    println!("=================");
    println!();
    println!("Data directory: {}", paths.base.display());
    println!(
        "HTTPS: {} on {}:{}",
        if config.https.enabled {
            "enabled"
        } else {
            "disabled"
        },
        config.https.host,
        config.https.port
    );
    println!();

    print!("Keystore: ");
    if !paths.keystore_exists() {
        println!("not provisioned");
        println!("    Run 'remote-tls init' to set up");
        return Ok(());
    }
    println!("{}", paths.keystore.display());

    let (provisioner, keystore) = open_keystore(paths, config)?;
    let info = keystore.certificate_info()?;
    println!();
    print_certificate(&keystore, &info);

    if info.is_expired() {
        eprintln!();
        eprintln!("Warning: the certificate has expired. Delete the keystore and run 'remote-tls init' to replace it.");
    }

    if probe {
        let entry_password = provisioner.entry_password(&paths.keystore)?;
        let tls = TlsContext::build(&keystore, &entry_password)?;
        println!();
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| Error::Config(format!("Failed to create runtime: {}", e)))?;
        let (protocol, cipher) = runtime.block_on(probe_listener(
            &tls,
            &config.https.host,
            config.https.port,
        ))?;
        println!("Probe: handshake OK ({}, {})", protocol, cipher);
    }

    Ok(())
}

async fn probe_listener(tls: &TlsContext, host: &str, port: u16) -> Result<(String, String)> {
    let server_name = ServerName::try_from(host.to_string()).map_err(|e| Error::InvalidHost {
        host: host.to_string(),
        reason: e.to_string(),
    })?;

    let handshake = async {
        let stream = tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Config(format!("Cannot connect to {}:{}: {}", host, port, e)))?;
        tls.connector()
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::TlsInit(format!("handshake with {}:{} failed: {}", host, port, e)))
    };

    let stream = tokio::time::timeout(PROBE_TIMEOUT, handshake)
        .await
        .map_err(|_| Error::Config(format!("Timed out probing {}:{}", host, port)))??;

    let connection = stream.get_ref().1;
    let protocol = connection
        .protocol_version()
        .map(|v| format!("{:?}", v))
        .unwrap_or_else(|| "unknown".into());
    let cipher = connection
        .negotiated_cipher_suite()
        .map(|s| format!("{:?}", s.suite()))
        .unwrap_or_else(|| "unknown".into());
    Ok((protocol, cipher))
}

fn cmd_trust(paths: &Paths, config: &Config) -> Result<()> {
    let (_, keystore) = open_keystore(paths, config)?;
    let trust = platform_trust();

    println!("Installing certificate into {}...", trust.name());
    if trust.install_certificate(ENTRY_ALIAS, keystore.certificate().der())? {
        println!("Certificate installed.");
    } else {
        println!("Nothing to do; certificate already trusted or no store available.");
    }
    Ok(())
}

fn cmd_serve(paths: Paths, config: &Config, port: u16, skip_trust: bool) -> Result<()> {
    if !config.https.enabled {
        return Err(Error::Config(format!(
            "HTTPS remote control is disabled in {}",
            paths.config.display()
        )));
    }

    let secrets = open_secrets(&paths)?;
    let mut server = RemoteControlServer::new(
        paths,
        &config.https,
        secrets,
        Arc::new(StatusDispatcher::default()),
    );
    if !skip_trust {
        server = server.with_trust(platform_trust());
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Config(format!("Failed to create runtime: {}", e)))?;

    runtime.block_on(async {
        let addr = server.start(port).await?;
        println!("Listening on https://{}", addr);
        println!("Press Ctrl+C to stop");

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot wait for Ctrl+C, shutting down");
        }

        println!("\nShutting down...");
        server.stop().await;
        Ok(())
    })
}

fn print_certificate(keystore: &Keystore, info: &CertInfo) {
    println!("Certificate:");
    println!("    Alias: {}", keystore.alias());
    println!("    Subject: {}", info.subject);
    println!(
        "    Expires: {} ({} days)",
        info.expiry_string(),
        info.days_remaining()
    );
    println!("    Serial: {}", info.serial);
    println!("    Signature: {}", info.signature_algorithm);
    if !info.subject_alt_names.is_empty() {
        println!("    SANs: {}", info.subject_alt_names.join(", "));
    }
    println!("    SHA-256: {}", keystore.certificate().fingerprint_sha256());
}
