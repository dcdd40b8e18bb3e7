//! cdoc2: CDOC2 encrypted container CLI
//!
//! Commands:
//!   create  -f <out.cdoc> -r <pub.pem>... <files>...   - encrypt files for recipients
//!   decrypt -f <in.cdoc> -k <key.pem> [-o dir] [names] - decrypt and extract
//!   list    -f <in.cdoc> -k <key.pem>                  - list payload entries
//!   info    -f <in.cdoc>                               - show header recipients (no key needed)
//!   config show                                        - print the active configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use cdoc2_container::{Envelope, Recipient};
use cdoc2_core::config::LogFormat;
use cdoc2_core::{Cdoc2Config, EnvelopeOptions};
use cdoc2_crypto::{encode_public_key, public_key_from_pem, EcKeyPair, PublicKey};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cdoc2",
    version,
    about = "CDOC2 encrypted container tool",
    long_about = "cdoc2: create, list, inspect, and decrypt multi-recipient CDOC2 containers"
)]
struct Cli {
    /// Path to cdoc2.toml configuration file
    #[arg(long, short = 'c', env = "CDOC2_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt files into a new container
    Create {
        /// Output container path
        #[arg(long, short = 'f')]
        file: PathBuf,
        /// Recipient public key (PEM, P-384); repeat for several recipients
        #[arg(long = "recipient", short = 'r', required = true)]
        recipients: Vec<PathBuf>,
        /// Wrap with this static sender key instead of per-recipient ephemeral keys
        #[arg(long)]
        sender: Option<PathBuf>,
        /// Files to include
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Decrypt a container and extract its files
    Decrypt {
        /// Container to decrypt
        #[arg(long, short = 'f')]
        file: PathBuf,
        /// Private key (PEM, SEC1 or PKCS#8)
        #[arg(long, short = 'k')]
        key: PathBuf,
        /// Destination directory (default: current directory)
        #[arg(long, short = 'o', default_value = ".")]
        output: PathBuf,
        /// Extract only these entries
        names: Vec<String>,
    },

    /// List the files inside a container
    List {
        #[arg(long, short = 'f')]
        file: PathBuf,
        #[arg(long, short = 'k')]
        key: PathBuf,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the recipients in a container header
    Info {
        #[arg(long, short = 'f')]
        file: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, missing) = load_config(cli.config.as_deref())?;
    init_logging(&config.log.level, &config.log.format);
    if let Some(path) = missing {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
    }

    let options = EnvelopeOptions::from(&config);

    match cli.command {
        Commands::Create {
            file,
            recipients,
            sender,
            inputs,
        } => cmd_create(&options, &file, &recipients, sender.as_deref(), &inputs),
        Commands::Decrypt {
            file,
            key,
            output,
            names,
        } => cmd_decrypt(&options, &file, &key, &output, &names),
        Commands::List { file, key, json } => cmd_list(&options, &file, &key, json),
        Commands::Info { file } => cmd_info(&file),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config),
    }
}

// ── Config / logging ──────────────────────────────────────────────────────────

/// Returns the config and, when a path was given but does not exist, that path.
fn load_config(path: Option<&Path>) -> Result<(Cdoc2Config, Option<PathBuf>)> {
    let Some(path) = path else {
        return Ok((Cdoc2Config::default(), None));
    };
    if !path.exists() {
        return Ok((Cdoc2Config::default(), Some(path.to_path_buf())));
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config = Cdoc2Config::from_toml_str(&content)
        .with_context(|| format!("parsing config: {}", path.display()))?;
    Ok((config, None))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Key loading ───────────────────────────────────────────────────────────────

fn load_key_pair(path: &Path) -> Result<EcKeyPair> {
    let pem = fs::read_to_string(path)
        .with_context(|| format!("reading private key: {}", path.display()))?;
    EcKeyPair::from_pem(&pem).with_context(|| format!("loading private key: {}", path.display()))
}

fn load_public_key(path: &Path) -> Result<PublicKey> {
    let pem = fs::read_to_string(path)
        .with_context(|| format!("reading public key: {}", path.display()))?;
    public_key_from_pem(&pem).with_context(|| format!("loading public key: {}", path.display()))
}

// ── `cdoc2 create` ────────────────────────────────────────────────────────────

fn cmd_create(
    options: &EnvelopeOptions,
    out: &Path,
    recipient_paths: &[PathBuf],
    sender: Option<&Path>,
    inputs: &[PathBuf],
) -> Result<()> {
    let recipients = recipient_paths
        .iter()
        .map(|p| load_public_key(p))
        .collect::<Result<Vec<_>>>()?;

    let fmk = cdoc2_crypto::generate_fmk().context("generating file master key")?;
    let envelope = match sender {
        Some(path) => {
            let sender = load_key_pair(path)?;
            tracing::warn!("using a static sender key; every document must get a fresh FMK");
            Envelope::prepare(&fmk, &sender, &recipients)
        }
        None => Envelope::prepare_ephemeral(&fmk, &recipients),
    }
    .context("preparing recipients")?;

    // Write next to the target and rename into place, so a failure never
    // leaves a half-written container behind
    let dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    let writer = envelope
        .encrypt(inputs, BufWriter::new(tmp), options)
        .with_context(|| format!("encrypting into {}", out.display()))?;
    let tmp = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("flushing container")?;
    tmp.persist(out)
        .with_context(|| format!("writing {}", out.display()))?;

    println!(
        "Created {} ({} file(s), {} recipient(s))",
        out.display(),
        inputs.len(),
        recipients.len()
    );
    Ok(())
}

// ── `cdoc2 decrypt` ───────────────────────────────────────────────────────────

fn cmd_decrypt(
    options: &EnvelopeOptions,
    file: &Path,
    key: &Path,
    output: &Path,
    names: &[String],
) -> Result<()> {
    let key_pair = load_key_pair(key)?;
    let input = open_container(file)?;

    let written = if names.is_empty() {
        Envelope::decrypt(input, &key_pair, output, options)
    } else {
        Envelope::decrypt_files(input, &key_pair, output, names, options)
    }
    .with_context(|| format!("decrypting {}", file.display()))?;

    for name in &written {
        println!("{}", output.join(name).display());
    }
    Ok(())
}

// ── `cdoc2 list` ──────────────────────────────────────────────────────────────

fn cmd_list(options: &EnvelopeOptions, file: &Path, key: &Path, json: bool) -> Result<()> {
    let key_pair = load_key_pair(key)?;
    let entries = Envelope::list(open_container(file)?, &key_pair, options)
        .with_context(|| format!("listing {}", file.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        let kind = if entry.is_dir { "d" } else { "-" };
        println!("{kind} {:>12}  {:>10}  {}", entry.size, entry.modified, entry.name);
    }
    Ok(())
}

// ── `cdoc2 info` ──────────────────────────────────────────────────────────────

fn cmd_info(file: &Path) -> Result<()> {
    let header = Envelope::read_header(open_container(file)?)
        .with_context(|| format!("reading header of {}", file.display()))?;

    println!("File:               {}", file.display());
    println!("Payload encryption: {:?}", header.payload_method);
    println!("Recipients:         {}", header.recipients.len());
    for (i, recipient) in header.recipients.iter().enumerate() {
        println!();
        println!("  [{i}] {}", recipient.kind());
        match recipient {
            Recipient::Ecc(r) => {
                println!("      recipient: {}", key_hex(r.recipient_public_key()));
                println!("      sender:    {}", key_hex(r.sender_public_key()));
                println!("      fmk wrap:  XOR");
            }
            Recipient::KeyServer(r) => {
                println!("      recipient: {}", key_hex(&r.recipient_public_key));
                println!("      server:    {}", r.key_server_id);
                println!("      txn:       {}", r.transaction_id);
            }
            Recipient::Unknown(r) => {
                println!("      details type: {} ({} bytes)", r.details_type, r.details.len());
            }
        }
    }
    Ok(())
}

// ── `cdoc2 config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &Cdoc2Config) -> Result<()> {
    print!("{}", toml::to_string_pretty(config).context("serializing config")?);
    Ok(())
}

fn open_container(path: &Path) -> Result<BufReader<fs::File>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn key_hex(key: &PublicKey) -> String {
    hex::encode(encode_public_key(key))
}
