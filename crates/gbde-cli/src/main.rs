//! gbde: encrypted block device tool
//!
//! Commands:
//!   init                  - format a device or image under a new passphrase
//!   setkey --index N      - put a (new) passphrase on lock copy N
//!   nuke [--index N]      - destroy one or all lock copies
//!   info                  - unlock and print the device geometry
//!   read / write / delete - plaintext I/O through the encryption layer
//!   config show           - display current configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroize;

use gbde_core::config::{BdeConfig, KdfConfig};
use gbde_crypto::KdfParams;
use gbde_engine::Device;
use gbde_lock::{decrypt_lock, max_sector, BdeKey, FormatOptions, KeyLocTable, FLAG_SECT0};
use gbde_storage::{BlockProvider, FileDevice};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "gbde",
    version,
    about = "Sector-level block device encryption",
    long_about = "gbde: format, unlock, and access devices encrypted with per-sector keys"
)]
struct Cli {
    /// Path to gbde.toml configuration file
    #[arg(long, short = 'c', env = "GBDE_CONFIG", default_value = "/etc/gbde/gbde.toml")]
    config: PathBuf,

    /// Backing device or image (overrides device.path)
    #[arg(long, short = 'd')]
    device: Option<PathBuf>,

    /// External key-location file (overrides device.lock_file)
    #[arg(long, short = 'l')]
    lock_file: Option<PathBuf>,

    /// Read the passphrase from this environment variable instead of prompting
    #[arg(long, value_name = "VAR")]
    passphrase_env: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides log.level)
    #[arg(long, env = "GBDE_LOG")]
    log: Option<String>,

    /// Log format (overrides log.format)
    #[arg(long, env = "GBDE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format the device: new master key, four lock copies, one passphrase
    Init {
        /// Create (or truncate) an image file of this many bytes first
        #[arg(long, value_name = "BYTES")]
        create: Option<u64>,
        /// Payload sectors per zone (overrides format.zone_cont)
        #[arg(long)]
        zone_cont: Option<u32>,
        /// Keep the key-location table in the lock file, not sector 0
        #[arg(long)]
        no_sector0: bool,
    },

    /// Re-encrypt one lock copy under a new passphrase
    Setkey {
        /// Lock copy to replace (0-3)
        #[arg(long, short = 'i')]
        index: usize,
        /// Read the new passphrase from this environment variable
        #[arg(long, value_name = "VAR")]
        new_passphrase_env: Option<String>,
    },

    /// Destroy lock copies; a device with none left can never be opened
    Nuke {
        /// Lock copy to destroy (0-3)
        #[arg(long, short = 'i', conflicts_with = "all")]
        index: Option<usize>,
        /// Destroy every lock copy
        #[arg(long)]
        all: bool,
    },

    /// Unlock the device and print its geometry
    Info,

    /// Decrypt a byte range to a file or stdout
    Read {
        #[arg(long)]
        offset: u64,
        #[arg(long)]
        length: u64,
        /// Output file (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Encrypt a file or stdin onto the device; length must be whole sectors
    Write {
        #[arg(long)]
        offset: u64,
        /// Input file (default: stdin)
        #[arg(long, short = 'i')]
        input: Option<PathBuf>,
    },

    /// Crypto-erase a byte range
    Delete {
        #[arg(long)]
        offset: u64,
        #[arg(long)]
        length: u64,
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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BdeConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| match config.log.format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        });
    init_logging(&level, &format);

    run(cli, config).await
}

async fn run(cli: Cli, mut config: BdeConfig) -> Result<()> {
    if let Some(device) = cli.device {
        config.device.path = device;
    }
    if cli.lock_file.is_some() {
        config.device.lock_file = cli.lock_file;
    }
    let pass_env = cli.passphrase_env.as_deref();

    match cli.command {
        Commands::Init {
            create,
            zone_cont,
            no_sector0,
        } => cmd_init(&config, create, zone_cont, no_sector0, pass_env),
        Commands::Setkey {
            index,
            new_passphrase_env,
        } => cmd_setkey(&config, index, pass_env, new_passphrase_env.as_deref()),
        Commands::Nuke { index, all } => cmd_nuke(&config, index, all, pass_env),
        Commands::Info => cmd_info(&config, pass_env),
        Commands::Read {
            offset,
            length,
            output,
        } => cmd_read(&config, offset, length, output.as_deref(), pass_env).await,
        Commands::Write { offset, input } => {
            cmd_write(&config, offset, input.as_deref(), pass_env).await
        }
        Commands::Delete { offset, length } => {
            cmd_delete(&config, offset, length, pass_env).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // logs go to stderr so `gbde read` can stream plaintext on stdout
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

// ── Shared helpers ────────────────────────────────────────────────────────────

fn kdf_params(kdf: &KdfConfig) -> KdfParams {
    KdfParams {
        mem_cost_kib: kdf.argon2_mem_cost_kib,
        time_cost: kdf.argon2_time_cost,
        parallelism: kdf.argon2_parallelism,
    }
}

/// Passphrase from the named environment variable, or prompted on the tty.
fn passphrase(env_var: Option<&str>, prompt: &str, confirm: bool) -> Result<SecretString> {
    if let Some(var) = env_var {
        let value = std::env::var(var)
            .with_context(|| format!("passphrase variable {var} is not set"))?;
        return Ok(SecretString::from(value));
    }

    let mut first = rpassword::prompt_password(prompt).context("reading passphrase")?;
    if confirm {
        let mut again =
            rpassword::prompt_password("Confirm passphrase: ").context("reading passphrase")?;
        let matched = first == again;
        again.zeroize();
        if !matched {
            first.zeroize();
            bail!("passphrases do not match");
        }
    }
    Ok(SecretString::from(first))
}

fn ensure_writable(config: &BdeConfig) -> Result<()> {
    if config.device.read_only {
        bail!(
            "{} is configured read-only (device.read_only)",
            config.device.path.display()
        );
    }
    Ok(())
}

fn open_provider(config: &BdeConfig) -> Result<Arc<dyn BlockProvider>> {
    let dev = &config.device;
    let file = FileDevice::open(&dev.path, dev.sector_size, dev.read_only)
        .with_context(|| format!("opening device: {}", dev.path.display()))?;
    Ok(Arc::new(file))
}

/// Recover the key without starting a device worker.
fn unlock(
    config: &BdeConfig,
    provider: &dyn BlockProvider,
    pass_env: Option<&str>,
) -> Result<(BdeKey, usize)> {
    let lock_file = config.device.lock_file.as_deref();
    let table = KeyLocTable::load(provider, lock_file).context("loading key-location table")?;
    let secret = passphrase(pass_env, "Passphrase: ", false)?;
    decrypt_lock(provider, &table, &secret, &kdf_params(&config.kdf))
        .with_context(|| format!("unlocking {}", config.device.path.display()))
}

fn open_device(config: &BdeConfig, pass_env: Option<&str>) -> Result<Device> {
    let provider = open_provider(config)?;
    let secret = passphrase(pass_env, "Passphrase: ", false)?;
    Device::open(
        provider,
        config.device.lock_file.as_deref(),
        &secret,
        &kdf_params(&config.kdf),
        &config.cache,
    )
    .with_context(|| format!("unlocking {}", config.device.path.display()))
}

async fn close_device(dev: Device) -> Result<()> {
    if let Ok(stats) = dev.stats().await {
        tracing::debug!(?stats, "device statistics");
    }
    dev.close().await.context("closing device")
}

// ── `gbde init` ───────────────────────────────────────────────────────────────

fn cmd_init(
    config: &BdeConfig,
    create: Option<u64>,
    zone_cont: Option<u32>,
    no_sector0: bool,
    pass_env: Option<&str>,
) -> Result<()> {
    ensure_writable(config)?;
    let dev = &config.device;
    let provider: Arc<dyn BlockProvider> = match create {
        Some(size) => Arc::new(
            FileDevice::create(&dev.path, size, dev.sector_size)
                .with_context(|| format!("creating image: {}", dev.path.display()))?,
        ),
        None => open_provider(config)?,
    };
    let opts = FormatOptions {
        zone_cont: zone_cont.unwrap_or(config.format.zone_cont),
        reserve_sector0: config.format.reserve_sector0 && !no_sector0,
    };

    let secret = passphrase(pass_env, "New passphrase: ", true)?;
    let key = gbde_lock::format(
        provider.as_ref(),
        dev.lock_file.as_deref(),
        &secret,
        &kdf_params(&config.kdf),
        &opts,
    )
    .with_context(|| format!("formatting {}", dev.path.display()))?;

    println!("formatted {}", dev.path.display());
    print_geometry(&key, None);
    Ok(())
}

// ── `gbde setkey` ─────────────────────────────────────────────────────────────

fn cmd_setkey(
    config: &BdeConfig,
    index: usize,
    pass_env: Option<&str>,
    new_pass_env: Option<&str>,
) -> Result<()> {
    ensure_writable(config)?;
    let provider = open_provider(config)?;
    let (key, opened) = unlock(config, provider.as_ref(), pass_env)?;

    let secret = passphrase(new_pass_env, "New passphrase: ", true)?;
    gbde_lock::set_key(
        provider.as_ref(),
        config.device.lock_file.as_deref(),
        &key,
        index,
        &secret,
        &kdf_params(&config.kdf),
    )
    .with_context(|| format!("setting key {index}"))?;
    println!("lock copy {index} re-keyed (unlocked with copy {opened})");
    Ok(())
}

// ── `gbde nuke` ───────────────────────────────────────────────────────────────

fn cmd_nuke(
    config: &BdeConfig,
    index: Option<usize>,
    all: bool,
    pass_env: Option<&str>,
) -> Result<()> {
    ensure_writable(config)?;
    if index.is_none() && !all {
        bail!("nuke needs --index N or --all");
    }
    let provider = open_provider(config)?;
    let (key, _) = unlock(config, provider.as_ref(), pass_env)?;
    gbde_lock::nuke(
        provider.as_ref(),
        config.device.lock_file.as_deref(),
        &key,
        index,
    )
    .context("destroying lock copies")?;
    match index {
        Some(i) => println!("lock copy {i} destroyed"),
        None => println!("all lock copies destroyed"),
    }
    Ok(())
}

// ── `gbde info` ───────────────────────────────────────────────────────────────

fn cmd_info(config: &BdeConfig, pass_env: Option<&str>) -> Result<()> {
    let provider = open_provider(config)?;
    let (key, index) = unlock(config, provider.as_ref(), pass_env)?;
    println!("device:       {}", config.device.path.display());
    print_geometry(&key, Some(index));
    Ok(())
}

fn print_geometry(key: &BdeKey, index: Option<usize>) {
    let sectors = max_sector(key);
    if let Some(i) = index {
        println!("unlocked by:  lock copy {i}");
    }
    println!("sector size:  {}", key.sectorsize);
    println!("sectors:      {sectors}");
    println!("size:         {} bytes", sectors * key.sectorsize as u64);
    println!("zone:         {} data + 1 key sector", key.zone_cont);
    println!("media:        {}..{}", key.sector0, key.sector_n);
    println!("key offset:   {}", key.keyoffset);
    println!(
        "lock sectors: {}",
        key.lsector
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "key table:    {}",
        if key.has_flag(FLAG_SECT0) {
            "sector 0"
        } else {
            "lock file"
        }
    );
}

// ── `gbde read` / `write` / `delete` ──────────────────────────────────────────

async fn cmd_read(
    config: &BdeConfig,
    offset: u64,
    length: u64,
    output: Option<&Path>,
    pass_env: Option<&str>,
) -> Result<()> {
    let dev = open_device(config, pass_env)?;
    let data = dev
        .read(offset, length)
        .await
        .with_context(|| format!("reading {length} bytes at {offset}"));
    close_device(dev).await?;
    let data = data?;

    match output {
        Some(path) => std::fs::write(path, &data)
            .with_context(|| format!("writing output: {}", path.display()))?,
        None => {
            let mut out = std::io::stdout().lock();
            out.write_all(&data).context("writing to stdout")?;
            out.flush()?;
        }
    }
    Ok(())
}

async fn cmd_write(
    config: &BdeConfig,
    offset: u64,
    input: Option<&Path>,
    pass_env: Option<&str>,
) -> Result<()> {
    ensure_writable(config)?;
    let data = match input {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("reading input: {}", path.display()))?
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("reading stdin")?;
            buf
        }
    };
    let ss = config.device.sector_size as usize;
    if ss == 0 || data.len() % ss != 0 {
        bail!(
            "input is {} bytes, not a multiple of the {ss}-byte sector size",
            data.len()
        );
    }

    let dev = open_device(config, pass_env)?;
    let len = data.len();
    let written = dev
        .write(offset, data)
        .await
        .with_context(|| format!("writing {len} bytes at {offset}"));
    close_device(dev).await?;
    written?;
    eprintln!("wrote {len} bytes at offset {offset}");
    Ok(())
}

async fn cmd_delete(
    config: &BdeConfig,
    offset: u64,
    length: u64,
    pass_env: Option<&str>,
) -> Result<()> {
    ensure_writable(config)?;
    let dev = open_device(config, pass_env)?;
    let deleted = dev
        .delete(offset, length)
        .await
        .with_context(|| format!("deleting {length} bytes at {offset}"));
    close_device(dev).await?;
    deleted?;
    eprintln!("erased {length} bytes at offset {offset}");
    Ok(())
}

// ── `gbde config show` ────────────────────────────────────────────────────────

fn cmd_config_show(config: &BdeConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn test_config(dir: &Path) -> BdeConfig {
        let mut config = BdeConfig::default();
        config.device.path = dir.join("disk.img");
        config.kdf = KdfConfig {
            argon2_mem_cost_kib: 1024,
            argon2_time_cost: 1,
            argon2_parallelism: 1,
        };
        config.cache.max_sectors = 64;
        config
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("gbde").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn nuke_index_and_all_conflict() {
        let parsed =
            Cli::try_parse_from(["gbde", "nuke", "--index", "1", "--all"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn kdf_config_maps_to_params() {
        let params = kdf_params(&KdfConfig::default());
        assert_eq!(params.mem_cost_kib, 65536);
        assert_eq!(params.time_cost, 3);
        assert_eq!(params.parallelism, 4);
    }

    #[test]
    fn missing_passphrase_variable_is_an_error() {
        let err = passphrase(Some("GBDE_TEST_UNSET_PASSPHRASE"), "", false).unwrap_err();
        assert!(err.to_string().contains("GBDE_TEST_UNSET_PASSPHRASE"));
    }

    #[tokio::test]
    async fn init_write_read_roundtrip() {
        std::env::set_var("GBDE_TEST_PASS_ROUNDTRIP", "correct horse");
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let pass = ["--passphrase-env", "GBDE_TEST_PASS_ROUNDTRIP"];

        let args: Vec<&str> = pass
            .iter()
            .copied()
            .chain(["init", "--create", "262144", "--zone-cont", "8"])
            .collect();
        run(cli(&args), config.clone()).await.unwrap();

        let input = dir.path().join("in.bin");
        let plain: Vec<u8> = (0..2048u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&input, &plain).unwrap();
        let input_arg = input.to_str().unwrap();
        let args: Vec<&str> = pass
            .iter()
            .copied()
            .chain(["write", "--offset", "4096", "--input", input_arg])
            .collect();
        run(cli(&args), config.clone()).await.unwrap();

        let output = dir.path().join("out.bin");
        let output_arg = output.to_str().unwrap();
        let args: Vec<&str> = pass
            .iter()
            .copied()
            .chain([
                "read", "--offset", "4096", "--length", "2048", "--output", output_arg,
            ])
            .collect();
        run(cli(&args), config.clone()).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), plain);

        let image = std::fs::read(&config.device.path).unwrap();
        assert!(!image.windows(plain.len()).any(|w| w == plain.as_slice()));
    }

    #[tokio::test]
    async fn read_only_config_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.device.read_only = true;
        let err = run(cli(&["delete", "--offset", "0", "--length", "512"]), config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn nuked_device_no_longer_unlocks() {
        std::env::set_var("GBDE_TEST_PASS_NUKE", "hunter2");
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let pass = Some("GBDE_TEST_PASS_NUKE");

        cmd_init(&config, Some(128 * 1024), None, false, pass).unwrap();
        cmd_info(&config, pass).unwrap();
        cmd_nuke(&config, None, true, pass).unwrap();
        assert!(cmd_info(&config, pass).is_err());
    }

    #[test]
    fn setkey_adds_second_passphrase() {
        std::env::set_var("GBDE_TEST_PASS_OLD", "first");
        std::env::set_var("GBDE_TEST_PASS_NEW", "second");
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        cmd_init(&config, Some(128 * 1024), None, false, Some("GBDE_TEST_PASS_OLD")).unwrap();
        cmd_setkey(&config, 2, Some("GBDE_TEST_PASS_OLD"), Some("GBDE_TEST_PASS_NEW")).unwrap();

        let provider = open_provider(&config).unwrap();
        let (_, index) = unlock(&config, provider.as_ref(), Some("GBDE_TEST_PASS_NEW")).unwrap();
        assert_eq!(index, 2);
        let (_, index) = unlock(&config, provider.as_ref(), Some("GBDE_TEST_PASS_OLD")).unwrap();
        assert_ne!(index, 2);
    }
}
