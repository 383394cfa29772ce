use alloy_primitives::{Address, Bytes, B256, U256};
use anyhow::{bail, Context};
use clap::{crate_authors, crate_version, ArgAction, Args, Parser, Subcommand};
use hsm_custody::config::DEFAULT_RESIGN_ATTEMPTS;
use hsm_custody::device::{Pkcs11Device, SlotId};
use hsm_custody::{
    Credentials, HsmConfig, LowSStrategy, SignedTransaction, SigningEngine, UnsignedTransaction,
};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

mod logging;

#[derive(Parser)]
#[command(version = crate_version!(), author = crate_authors!(), propagate_version = true)]
pub(crate) struct Opts {
    /// More logging: `-v` for DEBUG, `-vv` for TRACE. The default is INFO.
    #[arg(long, short, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Less logging: `-q` for WARN, `-qq` for ERROR, `-qqq` for none.
    #[arg(long, short, action = ArgAction::Count, global = true)]
    quiet: u8,

    #[command(flatten)]
    hsm: HsmOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct HsmOpts {
    /// Path of the PKCS#11 module.
    #[arg(long = "library", env = "HSM_LIB_PATH")]
    library_path: Option<PathBuf>,

    /// Crypto user name.
    #[arg(long, env = "CU_USERNAME")]
    user: Option<String>,

    /// Crypto user password.
    #[arg(long, env = "CU_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Security officer PIN. Only needed to provision new slots.
    #[arg(long, env = "SO_PASSWORD", hide_env_values = true)]
    so_pin: Option<String>,

    /// Deadline for each operation, e.g. `30s` or `1m 30s`.
    #[arg(long, env = "HSM_OPERATION_TIMEOUT", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Ask the HSM for a fresh signature when it returns a high-S one, instead
    /// of normalizing it.
    #[arg(long)]
    resign: bool,

    /// Signatures requested before giving up, with `--resign`.
    #[arg(
        long,
        default_value_t = DEFAULT_RESIGN_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..),
        requires = "resign"
    )]
    max_attempts: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Provisions a free slot under LABEL, generates its key and prints the address.
    CreateAddress {
        /// Label for the new slot.
        label: String,
    },

    /// Prints the address of the slot labelled LABEL.
    Address {
        /// Slot label.
        label: String,
    },

    /// Prints the address of the key held in SLOT.
    SlotAddress {
        /// Slot id.
        slot: SlotId,
    },

    /// Signs a legacy transaction with the key of the slot labelled LABEL.
    Sign(SignOpts),

    /// Lists the initialized slots and their labels.
    Slots,

    /// Decodes a signed transaction and recovers its signer. Needs no HSM.
    Decode {
        /// The hex-encoded transaction, with or without `0x`.
        raw: String,
    },
}

#[derive(Args)]
struct SignOpts {
    /// Slot label.
    label: String,

    /// EIP-155 chain id.
    #[arg(long)]
    chain_id: u64,

    /// The transaction as JSON, e.g. `{"nonce":1,"gasPrice":"0x64","gasLimit":100,
    /// "to":"0x…","value":"0x3e8"}`. `-` reads it from stdin.
    transaction: String,
}

impl HsmOpts {
    fn config(&self, provisioning: bool) -> anyhow::Result<HsmConfig> {
        let library_path = self
            .library_path
            .clone()
            .context("no PKCS#11 module given; pass --library or set HSM_LIB_PATH")?;
        let user = self
            .user
            .clone()
            .context("no crypto user given; pass --user or set CU_USERNAME")?;
        let password = self
            .password
            .clone()
            .context("no crypto user password given; set CU_PASSWORD")?;
        let so_pin = match (&self.so_pin, provisioning) {
            (Some(so_pin), _) => so_pin.clone(),
            (None, false) => String::new(),
            (None, true) => bail!("provisioning needs the security officer PIN; set SO_PASSWORD"),
        };

        let mut config = HsmConfig::new(library_path, Credentials::new(user, password, so_pin));
        if self.resign {
            config = config.with_low_s(LowSStrategy::Resign {
                max_attempts: self.max_attempts,
            });
        }
        if let Some(timeout) = self.timeout {
            config = config.with_operation_timeout(timeout);
        }
        Ok(config)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionOutput<'a> {
    from: Address,
    hash: B256,
    raw: Bytes,
    chain_id: u64,
    #[serde(flatten)]
    transaction: &'a UnsignedTransaction,
    v: u64,
    r: U256,
    s: U256,
}

impl<'a> TransactionOutput<'a> {
    fn new(signed: &'a SignedTransaction) -> anyhow::Result<Self> {
        Ok(TransactionOutput {
            from: signed
                .recover_signer()
                .context("cannot recover the signer")?,
            hash: signed.hash(),
            raw: signed.encode().into(),
            chain_id: signed.chain_id(),
            transaction: signed.transaction(),
            v: signed.v(),
            r: signed.signature().r(),
            s: signed.signature().s(),
        })
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_transaction(arg: &str) -> anyhow::Result<UnsignedTransaction> {
    let json = if arg == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("cannot read the transaction from stdin")?;
        buf
    } else {
        arg.to_string()
    };
    serde_json::from_str(&json).context("invalid transaction JSON")
}

fn decode(raw: &str) -> anyhow::Result<()> {
    let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
        .context("transaction is not valid hex")?;
    let signed = SignedTransaction::decode(&bytes)?;
    print_json(&TransactionOutput::new(&signed)?)
}

fn run(engine: &SigningEngine<Pkcs11Device>, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::CreateAddress { label } => print_json(
            &engine
                .create_address(label)
                .with_context(|| format!("cannot create an address for {label:?}"))?,
        ),
        Command::Address { label } => print_json(&engine.get_address_by_label(label)?),
        Command::SlotAddress { slot } => print_json(&engine.get_address_by_slot(*slot)?),
        Command::Sign(opts) => {
            let transaction = read_transaction(&opts.transaction)?;
            let signed = engine
                .sign_transaction(&transaction, opts.chain_id, &opts.label)
                .with_context(|| format!("cannot sign with {:?}", opts.label))?;
            print_json(&TransactionOutput::new(&signed)?)
        }
        Command::Slots => print_json(&engine.labels()?),
        Command::Decode { raw } => decode(raw),
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    logging::setup_logging(&opts);

    if let Command::Decode { raw } = &opts.command {
        return decode(raw);
    }
    let config = opts
        .hsm
        .config(matches!(opts.command, Command::CreateAddress { .. }))?;
    let engine = SigningEngine::connect(config).context("cannot open the HSM")?;
    run(&engine, &opts.command)
}
