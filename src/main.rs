use clap::{Args, Parser, Subcommand, ValueEnum};
use eyre::{ensure, Context, Result};
use std::path::PathBuf;
use tracing::{debug, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use xtsn::{registry, BackendPreference, Direction, Position, Xtsn, DEFAULT_SECTOR_SIZE};

fn parse_key(s: &str) -> std::result::Result<[u8; 16], String> {
    let bytes = hex::decode(s.trim()).map_err(|e| format!("invalid hex: {e}"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| format!("key must be 16 bytes, got {}", bytes.len()))
}

fn parse_u128(s: &str) -> std::result::Result<u128, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u128::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_u64(s: &str) -> std::result::Result<u64, String> {
    let value = parse_u128(s)?;
    u64::try_from(value).map_err(|_| format!("{s} does not fit in 64 bits"))
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Portable,
}

impl From<BackendArg> for BackendPreference {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendPreference::Auto,
            BackendArg::Portable => BackendPreference::Portable,
        }
    }
}

#[derive(Parser)]
#[command(about = "Nintendo AES-XTSN sector cipher")]
struct Cli {
    /// Block cipher implementation to use
    #[arg(long, value_enum, default_value_t = BackendArg::Auto, global = true)]
    backend: BackendArg,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CryptArgs {
    /// Data key, 32 hex digits
    #[arg(short = 'c', long, value_parser = parse_key)]
    crypt: [u8; 16],
    /// Tweak key, 32 hex digits
    #[arg(short = 't', long, value_parser = parse_key)]
    tweak: [u8; 16],
    /// Sector the input starts in (or is counted from, with --skipped-bytes)
    #[arg(short = 's', long, default_value = "0", value_parser = parse_u128)]
    sector: u128,
    #[arg(long, default_value_t = DEFAULT_SECTOR_SIZE, value_parser = parse_u64)]
    sector_size: u64,
    #[arg(long, default_value = "0", value_parser = parse_u64)]
    skipped_bytes: u64,
    #[arg(index = 1)]
    input: PathBuf,
    #[arg(index = 2)]
    output: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    Encrypt(CryptArgs),
    Decrypt(CryptArgs),
    /// Print the backend that gets selected
    Backend,
}

fn crypt_file(args: CryptArgs, direction: Direction) -> Result<()> {
    ensure!(
        args.input.is_file(),
        "input {:?} does not exist!",
        args.input
    );
    let xtsn = Xtsn::new(&args.crypt, &args.tweak)?;
    let mut data =
        std::fs::read(&args.input).wrap_err_with(|| format!("Couldn't read {:?}", args.input))?;
    let position = Position::new(args.sector)
        .with_sector_size(args.sector_size)
        .with_skipped_bytes(args.skipped_bytes);
    xtsn.transform_in_place(&mut data, position, direction)
        .wrap_err("Cipher operation failed")?;
    std::fs::write(&args.output, &data)
        .wrap_err_with(|| format!("Couldn't write {:?}", args.output))?;
    debug!(
        "{direction:?}ed {} bytes into {:?}",
        data.len(),
        args.output
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up xtsn cli");
    let backend = registry::initialize_with(cli.backend.into());
    let result = match cli.command {
        Command::Encrypt(args) => crypt_file(args, Direction::Encrypt),
        Command::Decrypt(args) => crypt_file(args, Direction::Decrypt),
        Command::Backend => {
            println!("{}", backend.name());
            Ok(())
        }
    };
    registry::teardown();
    result
}
