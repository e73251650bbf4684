use thiserror::Error;

use crate::address::AddressError;
use crate::grant::{EncodingError, InvalidAllowance};
use crate::ledger::LedgerError;
use crate::sheet::StoreError;

/// Why a single row did not produce a grant. The display text is what lands
/// in the row's outcome cell.
#[derive(Debug, Error)]
pub enum RowError {
    /// Fewer cells than the identity and amount columns need.
    #[error("malformed row: expected at least {expected} cells, found {found}")]
    MalformedRow { expected: usize, found: usize },

    /// Identity cell is not a usable address; carries the parser's message.
    #[error("{0}")]
    InvalidIdentity(#[from] AddressError),

    /// Amount cell rejected under the strict allowance policy.
    #[error(transparent)]
    InvalidAllowance(#[from] InvalidAllowance),

    /// Params could not be serialized.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The node refused or never received the message.
    #[error("{0}")]
    Submission(#[from] LedgerError),
}

impl RowError {
    pub fn kind(&self) -> &'static str {
        match self {
            RowError::MalformedRow { .. } => "malformed_row",
            RowError::InvalidIdentity(_) => "invalid_identity",
            RowError::InvalidAllowance(_) => "invalid_allowance",
            RowError::Encoding(_) => "encoding",
            RowError::Submission(_) => "submission",
        }
    }
}

/// Failures that stop the whole run.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("fetching {range} from {spreadsheet}: {source}")]
    Fetch {
        spreadsheet: String,
        range: String,
        #[source]
        source: StoreError,
    },

    /// Sheet and ledger would disagree from here on, so the run halts.
    #[error("writing outcome to {cell}: {source}")]
    WriteBack {
        cell: String,
        #[source]
        source: StoreError,
    },
}
