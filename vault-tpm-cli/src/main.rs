//! vault-tpm - seal and unseal vault unlock secrets with a TPM

mod commands;
mod config;
mod logging;

use clap::{Parser, Subcommand, ValueEnum};
use config::{CliConfig, Overrides};
use logging::LogFormat;
use std::path::PathBuf;
use vault_tpm::{ParentPolicy, SecretStore, TpmBackend, TpmEngine};

#[derive(Parser, Debug)]
#[command(name = "vault-tpm", version, about = "Seal and unseal vault unlock secrets with a TPM 2.0")]
struct Cli {
    /// Configuration file (TOML with [tpm] and [logging] tables)
    #[arg(short, long, env = "VAULT_TPM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// TPM device path (e.g. /dev/tpmrm0, or a TCTI string such as swtpm:port=2321)
    #[arg(long, global = true)]
    device: Option<String>,

    /// Device backend
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendArg>,

    /// Primary key template (rsa or ecc)
    #[arg(long, global = true)]
    template: Option<String>,

    /// Log level or filter directive
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (text, compact, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    /// In-process software TPM (state is lost when the process exits)
    Simulation,
    /// TPM reached through --device
    Device,
}

impl From<BackendArg> for TpmBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Simulation => TpmBackend::Simulation,
            BackendArg::Device => TpmBackend::Device,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ParentArg {
    /// Reuse a healthy recorded key; replace it when stale or when this is
    /// the only blob pair sealed under it
    Auto,
    /// Always replace the recorded key (other blob pairs in the directory
    /// become unsealable)
    Fresh,
    /// Reuse any recorded key without checking the device
    Reuse,
}

impl From<ParentArg> for ParentPolicy {
    fn from(arg: ParentArg) -> Self {
        match arg {
            ParentArg::Auto => ParentPolicy::Auto,
            ParentArg::Fresh => ParentPolicy::Fresh,
            ParentArg::Reuse => ParentPolicy::Reuse,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seal stdin (or --input) to <OUTPUT>.prv / <OUTPUT>.pub
    Seal {
        /// Base path of the sealed blob pair
        output: PathBuf,

        /// Read the secret from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Treatment of the primary key recorded in the output directory
        #[arg(long, value_enum, default_value_t = ParentArg::Auto)]
        parent: ParentArg,
    },

    /// Unseal the blob pair at <PATH>
    Unseal {
        /// Base path of the sealed blob pair
        path: PathBuf,

        /// Write the secret to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Seal a vault init record (JSON) through the configured secret store
    SealBundle {
        /// Base path of the sealed record
        base: PathBuf,

        /// Read the record from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Unseal a vault init record
    UnsealBundle {
        /// Base path of the sealed record
        base: PathBuf,

        /// Write the record to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Print only the root token
        #[arg(long)]
        root_token: bool,
    },

    /// Flush the primary key recorded in a directory, or an explicit handle
    Flush {
        /// Directory holding the parentHndl ledger
        #[arg(long, conflicts_with = "handle")]
        dir: Option<PathBuf>,

        /// Handle to flush (hex, e.g. 0x81010000)
        #[arg(long)]
        handle: Option<String>,
    },

    /// Show device availability and the recorded parent handle
    Status {
        /// Directory holding the parentHndl ledger
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },

    /// Print the number of loaded sessions on the device
    Sessions,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = CliConfig::load(cli.config.as_deref())?.apply(Overrides {
        device: cli.device,
        backend: cli.backend.map(TpmBackend::from),
        template: cli.template,
        log_level: cli.log_level,
        log_format: cli.log_format,
    })?;
    logging::init_logging(&config.logging)?;

    let output = match &cli.command {
        Command::SealBundle { base, input } => {
            let store = SecretStore::from_config(&config.tpm)?;
            commands::bundle::seal(&store, input.as_deref(), base)?
        }
        Command::UnsealBundle {
            base,
            out,
            root_token,
        } => {
            let store = SecretStore::from_config(&config.tpm)?;
            commands::bundle::unseal(&store, base, out.as_deref(), *root_token)?
        }
        command => {
            let engine = TpmEngine::from_config(&config.tpm)?;
            run_engine_command(&engine, &config, command)?
        }
    };

    println!("{}", output);
    Ok(())
}

fn run_engine_command(engine: &TpmEngine, config: &CliConfig, command: &Command) -> commands::CommandResult {
    match command {
        Command::Seal {
            output,
            input,
            parent,
        } => commands::seal::execute(
            engine,
            input.as_deref(),
            output,
            Some(config.tpm.key_template.as_str()),
            ParentPolicy::from(*parent),
        ),
        Command::Unseal { path, out } => commands::unseal::execute(engine, path, out.as_deref()),
        Command::Flush { dir, handle } => {
            commands::flush::execute(engine, dir.as_deref(), handle.as_deref())
        }
        Command::Status { dir } => commands::status::execute(engine, &config.tpm, dir),
        Command::Sessions => commands::sessions::execute(engine),
        Command::SealBundle { .. } | Command::UnsealBundle { .. } => {
            anyhow::bail!("bundle commands go through the secret store")
        }
    }
}
