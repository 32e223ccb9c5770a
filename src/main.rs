use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ecr_token_generator::settings::Settings;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a generator once and print the resulting secret data
    Generate {
        /// Generator kind (e.g. ECRAuthorizationToken)
        #[arg(long, default_value = "ECRAuthorizationToken")]
        kind: String,
        /// Generator manifest (YAML or JSON)
        #[arg(long)]
        spec: PathBuf,
        /// Namespace used to resolve secrets and service accounts
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        /// Print secret values instead of redacting them
        #[arg(long)]
        reveal: bool,
    },
    /// List registered generator kinds
    Kinds,
}

/// Read a manifest and re-encode it as JSON
fn read_manifest(path: &Path) -> Result<Vec<u8>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let value: serde_json::Value = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
    serde_json::to_vec(&value).context("Failed to encode manifest as JSON")
}

async fn kube_client(settings: &Settings) -> Result<kube::Client> {
    // Install default CryptoProvider for rustls (required for kube-rs HTTPS connections)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let kube_config = if settings.kubernetes.kubeconfig {
        kube::Config::from_kubeconfig(&kube::config::KubeConfigOptions {
            context: None,
            cluster: None,
            user: None,
        })
        .await?
    } else {
        kube::Config::infer().await? // In-cluster or ~/.kube/config
    };
    Ok(kube::Client::try_from(kube_config)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::new().context("Failed to load configuration")?;
    let registry = ecr_token_generator::default_registry(&settings);

    match cli.command {
        Commands::Kinds => {
            for kind in registry.kinds() {
                println!("{}", kind);
            }
        }
        Commands::Generate {
            kind,
            spec,
            namespace,
            reveal,
        } => {
            let manifest = read_manifest(&spec)?;
            let kube = kube_client(&settings).await?;

            let bundle = registry
                .generate(&kind, Some(manifest.as_slice()), &kube, &namespace)
                .await?;

            let mut keys: Vec<&String> = bundle.keys().collect();
            keys.sort();
            for key in keys {
                let value = if reveal {
                    String::from_utf8_lossy(&bundle[key]).into_owned()
                } else {
                    format!("<{} bytes>", bundle[key].len())
                };
                println!("{}: {}", key, value);
            }
        }
    }

    Ok(())
}
