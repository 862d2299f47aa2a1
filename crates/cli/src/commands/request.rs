//! Config request commands

use anyhow::{Context, Result};
use clap::Subcommand;
use meshconf_common::{
    AddressPlan, ConfigRequest, ConfigService, KeyPair, NodeStore, SignifyPublicKey,
    TokioResolver,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::output::{print_success, print_value, OutputFormat};

#[derive(Subcommand)]
pub enum RequestCommands {
    /// Answer one config request and print the signed reply
    Answer {
        /// Node public key (base64)
        #[arg(long)]
        pubkey: String,

        /// Nonce echoed back in the reply
        #[arg(long)]
        nonce: String,

        /// IPv6 path MTU measured by the node
        #[arg(long)]
        v6mtu: Option<u16>,

        /// Address the request came from
        #[arg(long)]
        client_addr: Option<String>,

        /// Signify secret key file (unencrypted)
        #[arg(long, env = "MESHCONF_SIGNING_KEY")]
        key_file: PathBuf,

        /// Print request counters to stderr afterwards
        #[arg(long)]
        stats: bool,
    },

    /// Check the signature of a reply
    Verify {
        /// Signify public key file
        #[arg(long, env = "MESHCONF_VERIFY_KEY")]
        pubkey_file: PathBuf,

        /// Reply to check, read from stdin when omitted
        reply: Option<PathBuf>,
    },

    /// Generate a signify key pair
    Keygen {
        /// Secret key output file
        path: PathBuf,

        /// Public key output file (default: secret key path with a .pub extension)
        #[arg(long)]
        public: Option<PathBuf>,
    },
}

pub async fn execute(cmd: RequestCommands, store: NodeStore, format: OutputFormat) -> Result<()> {
    match cmd {
        RequestCommands::Answer {
            pubkey,
            nonce,
            v6mtu,
            client_addr,
            key_file,
            stats,
        } => {
            let signer = KeyPair::load(&key_file)
                .await
                .with_context(|| format!("loading signing key {}", key_file.display()))?;
            debug!("Signing with {:?}", signer);

            let plan = AddressPlan::default().with_env_overrides()?;
            let service = ConfigService::new(
                store.clone(),
                plan,
                Arc::new(signer),
                Arc::new(TokioResolver),
            );

            let request = ConfigRequest {
                pubkey,
                nonce,
                v6mtu,
                client_addr,
            };
            let outcome = service.handle(&request).await;

            if stats {
                let report = service.metrics().report(&store).await?;
                eprintln!("{}", serde_json::to_string(&report)?);
            }

            println!("{}", outcome?);
        }

        RequestCommands::Verify { pubkey_file, reply } => {
            let key = SignifyPublicKey::load(&pubkey_file).await?;

            let mut text = String::new();
            match &reply {
                Some(path) => {
                    text = tokio::fs::read_to_string(path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                }
                None => {
                    tokio::io::stdin().read_to_string(&mut text).await?;
                }
            }

            let body = key
                .verify_reply(&text)
                .context("The signature is INVALID")?;
            print_success("The signature is valid");
            print!("{body}");
        }

        RequestCommands::Keygen { path, public } => {
            let public = public.unwrap_or_else(|| public_key_path(&path));
            for target in [&path, &public] {
                if target.exists() {
                    anyhow::bail!("{} already exists", target.display());
                }
            }

            let key = KeyPair::generate();
            key.save(&path).await?;
            key.public_key().save(&public).await?;
            print_success(&format!(
                "Wrote {} and {}",
                path.display(),
                public.display()
            ));
            print_value("public_key", &key.public_key().to_signify(), format)?;
        }
    }

    Ok(())
}

/// `key.sec` -> `key.pub`, anything else gets `.pub` appended
fn public_key_path(secret: &Path) -> PathBuf {
    if secret.extension().is_some_and(|ext| ext == "sec") {
        secret.with_extension("pub")
    } else {
        let mut name = secret.as_os_str().to_owned();
        name.push(".pub");
        PathBuf::from(name)
    }
}
