use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mnemo_crypto::share::calculate_rendezvous_id;
use mnemo_crypto::{Fingerprint, Identity, PublicIdentity, WrappedKey};
use mnemo_store::capsule::CapsuleMetadata;
use mnemo_store::config::VaultConfig;
use mnemo_store::paths::config_path;
use mnemo_store::storage::open_storage;
use mnemo_store::{HeaderView, Vault, VaultError};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const PASSPHRASE_ENV: &str = "MNEMO_PASSPHRASE";
const MIN_PASSPHRASE_LEN: usize = 12;

#[derive(Parser, Debug)]
#[command(name = "mnemo", author, version, about = "Mnemo encrypted memory vault", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Vault name
    #[arg(long, global = true, default_value = "default")]
    vault: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a vault and set its passphrase
    Init,

    /// Add a capsule from an argument, a file, or stdin
    Add {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "user")]
        role: String,
        #[arg(long, default_value = "cli")]
        source: String,
        #[arg(long = "type", default_value = "note")]
        kind: String,
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        text: Option<String>,
    },

    /// List recent capsules, newest first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Print a capsule's content
    Show { id: String },

    /// Delete a capsule (appends a tombstone)
    Rm { id: String },

    /// Capsule and blob counts
    Stats,

    /// Write the vault file to OUT
    Export { out: PathBuf },

    /// Import a vault file under --vault
    Import { file: PathBuf },

    /// Recently opened vaults
    Recent,

    /// Recovery snapshots kept after failed writes
    Recovery,

    /// Manage this vault's identity
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },

    /// Wrap the vault key for a recipient's public identity (JSON file)
    Share {
        recipient: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Unlock --vault with a received bundle, using the identity in IDENTITY_VAULT
    Receive {
        bundle: PathBuf,
        #[arg(long)]
        identity_vault: String,
    },

    /// Channel id shared with the holder of FINGERPRINT
    Rendezvous { fingerprint: String },
}

#[derive(Subcommand, Debug)]
enum IdentityCommands {
    /// Generate and store a new identity
    New,
    /// Print the public identity as JSON
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_file = match &cli.config {
        Some(path) => path.clone(),
        None => config_path()?,
    };
    let config = VaultConfig::load_or_default(&config_file)
        .with_context(|| format!("reading {}", config_file.display()))?;

    match cli.command {
        Commands::Init => init_command(&config, &cli.vault).await,
        Commands::Add {
            title,
            role,
            source,
            kind,
            file,
            text,
        } => {
            let content = read_content(file, text)?;
            let vault = unlocked(&config, &cli.vault).await?;
            let metadata = CapsuleMetadata {
                title,
                role,
                source,
                kind,
                timestamp: None,
            };
            let id = vault.create_capsule(&content, metadata).await?;
            println!("{id}");
            Ok(())
        }
        Commands::List { limit } => {
            let vault = unlocked(&config, &cli.vault).await?;
            let listing = vault.list_capsules(limit).await?;
            for item in &listing.items {
                match &item.header {
                    HeaderView::Unlocked(header) => println!(
                        "{}  {}  [{}] {}",
                        item.id,
                        header.timestamp.to_rfc3339(),
                        header.kind,
                        header.title
                    ),
                    HeaderView::Locked { .. } => {
                        println!("{}  {}  <unreadable>", item.id, item.timestamp.to_rfc3339())
                    }
                }
            }
            if listing.skipped > 0 {
                eprintln!("{} invalid log record(s) skipped", listing.skipped);
            }
            Ok(())
        }
        Commands::Show { id } => {
            let vault = unlocked(&config, &cli.vault).await?;
            let content = vault.get_capsule_content(&id).await?;
            std::io::stdout().write_all(&content)?;
            Ok(())
        }
        Commands::Rm { id } => {
            let vault = unlocked(&config, &cli.vault).await?;
            vault.delete_capsule(&id).await?;
            println!("deleted {id}");
            Ok(())
        }
        Commands::Stats => {
            let vault = existing(&config, &cli.vault).await?;
            println!("{}", serde_json::to_string_pretty(&vault.stats().await?)?);
            Ok(())
        }
        Commands::Export { out } => {
            let vault = existing(&config, &cli.vault).await?;
            let export = vault.export().await?;
            std::fs::write(&out, &export.bytes)?;
            println!("{} bytes, sha256 {}", export.manifest.size, export.manifest.hash);
            Ok(())
        }
        Commands::Import { file } => {
            let bytes = std::fs::read(&file)?;
            let vault =
                Vault::import(open_storage(&config)?, &cli.vault, &bytes, config.kdf).await?;
            println!("imported {} ({})", vault.handle().name, vault.handle().id);
            Ok(())
        }
        Commands::Recent => {
            let storage = open_storage(&config)?;
            let recent = storage.list_recent_vaults().await?;
            println!("{}", serde_json::to_string_pretty(&recent)?);
            Ok(())
        }
        Commands::Recovery => {
            let vault = existing(&config, &cli.vault).await?;
            for file in vault.recovery_files().await? {
                println!("{file}");
            }
            Ok(())
        }
        Commands::Identity { command } => identity_command(&config, &cli.vault, command).await,
        Commands::Share { recipient, out } => {
            let raw = std::fs::read(&recipient)?;
            let recipient: PublicIdentity =
                serde_json::from_slice(&raw).context("recipient identity JSON")?;
            let vault = unlocked(&config, &cli.vault).await?;
            let bundle = vault.share_with(&recipient).await?;
            let json = serde_json::to_string_pretty(&bundle)?;
            match out {
                Some(path) => std::fs::write(path, json)?,
                None => println!("{json}"),
            }
            Ok(())
        }
        Commands::Receive {
            bundle,
            identity_vault,
        } => {
            let bundle: WrappedKey = serde_json::from_slice(&std::fs::read(&bundle)?)
                .context("bundle JSON")?;
            let home = unlocked(&config, &identity_vault).await?;
            let identity = home
                .identities()
                .load_identity(home.keyring())
                .await?
                .ok_or_else(|| anyhow!("vault {identity_vault} has no identity"))?;
            let vault = existing(&config, &cli.vault).await?;
            vault.open_shared(&bundle, &identity).await?;
            let listing = vault.list_capsules(usize::MAX).await?;
            println!(
                "opened {} with shared key: {} capsule(s)",
                cli.vault,
                listing.items.len()
            );
            Ok(())
        }
        Commands::Rendezvous { fingerprint } => {
            let vault = existing(&config, &cli.vault).await?;
            let ours = vault
                .identities()
                .public_identity()
                .await?
                .ok_or_else(|| anyhow!("no identity; run `mnemo identity new` first"))?;
            let theirs = Fingerprint::parse(&fingerprint)?;
            println!("{}", calculate_rendezvous_id(&ours.fingerprint, &theirs));
            Ok(())
        }
    }
}

async fn init_command(config: &VaultConfig, name: &str) -> Result<()> {
    let storage = open_storage(config)?;
    if storage.vault_exists(name).await? {
        return Err(anyhow!("vault {name} already exists"));
    }
    let vault = Vault::open(storage, name, config.kdf).await?;
    let passphrase = prompt_passphrase_twice("Create vault passphrase")?;
    vault.unlock(&passphrase).await?;
    info!(vault = %name, "vault initialised");
    println!("Vault {} created ({})", name, vault.handle().id);
    Ok(())
}

async fn identity_command(config: &VaultConfig, name: &str, command: IdentityCommands) -> Result<()> {
    match command {
        IdentityCommands::New => {
            let vault = unlocked(config, name).await?;
            if vault.identities().public_identity().await?.is_some() {
                return Err(anyhow!("vault {name} already has an identity"));
            }
            let identity = Identity::generate()?;
            vault
                .identities()
                .store_identity(vault.keyring(), &identity)
                .await?;
            println!("Fingerprint: {}", identity.fingerprint());
        }
        IdentityCommands::Show => {
            let vault = existing(config, name).await?;
            let public = vault
                .identities()
                .public_identity()
                .await?
                .ok_or_else(|| anyhow!("no identity; run `mnemo identity new` first"))?;
            println!("{}", serde_json::to_string_pretty(&public)?);
        }
    }
    Ok(())
}

/// Open a vault that has already been initialised. Missing vaults are
/// reported without being recorded as recently used.
async fn existing(config: &VaultConfig, name: &str) -> Result<Vault> {
    match Vault::open_existing_with_config(config, name).await {
        Err(VaultError::NotFound(_)) => Err(anyhow!("vault {name} missing; run `mnemo init` first")),
        other => Ok(other?),
    }
}

async fn unlocked(config: &VaultConfig, name: &str) -> Result<Vault> {
    let vault = existing(config, name).await?;
    let passphrase = prompt_passphrase(&format!("Passphrase for {name}"))?;
    vault.unlock(&passphrase).await?;
    Ok(vault)
}

fn read_content(file: Option<PathBuf>, text: Option<String>) -> Result<Vec<u8>> {
    if let Some(path) = file {
        return std::fs::read(&path).with_context(|| format!("reading {}", path.display()));
    }
    if let Some(text) = text {
        return Ok(text.into_bytes());
    }
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf)?;
    Ok(buf)
}

fn prompt_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(PASSPHRASE_ENV) {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(format!("{prompt}: "))
        .map_err(|e| anyhow!("passphrase prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

fn prompt_passphrase_twice(prompt: &str) -> Result<Zeroizing<String>> {
    let first = prompt_passphrase(prompt)?;
    if first.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(anyhow!(
            "passphrase too short; minimum {MIN_PASSPHRASE_LEN} characters"
        ));
    }
    if std::env::var(PASSPHRASE_ENV).map_or(false, |pw| !pw.is_empty()) {
        return Ok(first);
    }
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm passphrase: ")
            .map_err(|e| anyhow!("passphrase prompt: {e}"))?,
    );
    if *first != *second {
        return Err(anyhow!("passphrases do not match"));
    }
    Ok(first)
}
