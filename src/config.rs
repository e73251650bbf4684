use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::address::{Address, AddressError, Network};
use crate::grant::AllowancePolicy;
use crate::retry::RetryPolicy;
use crate::sheet::{SheetLayout, DEFAULT_FIRST_ROW, DEFAULT_SHEET};

#[derive(Parser, Debug)]
#[command(name = "auto-notary", version, about = "Devnet DataCap distribution utility")]
pub struct Cli {
    /// Lotus repo holding the node's `api` and `token` files
    #[arg(long, env = "LOTUS_PATH", default_value = "~/.lotus", global = true)]
    pub repo: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Grant DataCap for every pending spreadsheet row
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Notary address that signs every grant
    #[arg(long)]
    pub from: String,

    /// Spreadsheet holding the form responses
    #[arg(long = "spreadsheet-id", alias = "spreadsheetID")]
    pub spreadsheet_id: String,

    /// Google credentials file (service_account key or authorized_user)
    #[arg(long = "cred-file", alias = "credFile")]
    pub cred_file: Option<PathBuf>,

    /// Sheet (tab) name
    #[arg(long, default_value = DEFAULT_SHEET)]
    pub sheet: String,

    /// Row number of the first request, below the header
    #[arg(long, default_value_t = DEFAULT_FIRST_ROW)]
    pub first_row: u32,

    /// Fail rows whose amount is not a whole number instead of granting zero
    #[arg(long)]
    pub strict_allowance: bool,

    #[arg(long, default_value_t = 5)]
    pub retry_attempts: usize,

    #[arg(long, default_value_t = 250)]
    pub retry_base_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    pub retry_max_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub http_timeout_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parsing source address (provide correct --from flag!): {0}")]
    Operator(#[from] AddressError),
    #[error("--first-row must be at least 1")]
    FirstRow,
}

/// Everything a run needs, validated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub operator: Address,
    pub network: Network,
    pub spreadsheet_id: String,
    pub cred_file: Option<PathBuf>,
    pub layout: SheetLayout,
    pub policy: AllowancePolicy,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub repo: PathBuf,
}

impl RunConfig {
    pub fn from_args(repo: &Path, args: RunArgs) -> Result<Self, ConfigError> {
        let from = args.from.trim();
        let operator: Address = from.parse()?;
        if operator.is_undef() {
            return Err(ConfigError::Operator(AddressError::Undefined));
        }
        if args.first_row == 0 {
            return Err(ConfigError::FirstRow);
        }
        Ok(RunConfig {
            network: Network::of(from).unwrap_or_default(),
            operator,
            spreadsheet_id: args.spreadsheet_id,
            cred_file: args.cred_file,
            layout: SheetLayout {
                sheet: args.sheet,
                first_row: args.first_row,
            },
            policy: if args.strict_allowance {
                AllowancePolicy::Strict
            } else {
                AllowancePolicy::Permissive
            },
            retry: RetryPolicy::new(args.retry_attempts, args.retry_base_ms, args.retry_max_ms, 0.2),
            http_timeout: Duration::from_millis(args.http_timeout_ms),
            repo: expand_home(repo),
        })
    }
}

/// Expand a leading `~` using `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
