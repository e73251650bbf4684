//! Per-row pipeline: validate the cells, resolve the requester, build and
//! push the grant, and record exactly one outcome for the row.
//!
//! ```text
//! Fetched ─┬─> Skipped                         (outcome cell already filled)
//!          └─> Validated ─> Resolved ─> Built ─> Submitted ─> Recorded
//!                  │            │           │
//!                  └────────────┴───────────┴──> Failed
//!   malformed rows and unresolvable identities fail from Validated;
//!   Recorded and Failed both write back exactly once
//! ```

use std::fmt;

use tracing::{debug, info, warn};

use crate::address::{self, Address};
use crate::error::{BatchError, RowError};
use crate::grant::{Allowance, AllowancePolicy, GrantRequestBuilder, Message};
use crate::ledger::{GrantSubmitter, LedgerClient, Receipt};
use crate::sheet::{RowStore, Worksheet};

/// Timestamp, identity and amount.
pub const MIN_CELLS: usize = 3;
/// A row with more cells than this already carries an outcome.
pub const MAX_PENDING_CELLS: usize = 3;

/// A pending request, cells named instead of indexed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Row {
    pub index: usize,
    pub timestamp: String,
    pub identity: String,
    pub amount: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedRow {
    AlreadyProcessed,
    Pending(Row),
}

impl Row {
    pub fn parse(index: usize, cells: Vec<String>) -> Result<ParsedRow, RowError> {
        if cells.len() > MAX_PENDING_CELLS {
            return Ok(ParsedRow::AlreadyProcessed);
        }
        if cells.len() < MIN_CELLS {
            return Err(RowError::MalformedRow {
                expected: MIN_CELLS,
                found: cells.len(),
            });
        }
        let mut cells = cells.into_iter();
        let mut next = || cells.next().unwrap_or_default();
        Ok(ParsedRow::Pending(Row {
            index,
            timestamp: next(),
            identity: next(),
            amount: next(),
        }))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Fetched,
    Validated,
    Resolved,
    Built,
    Submitted,
    Recorded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetched => "fetched",
            Stage::Validated => "validated",
            Stage::Resolved => "resolved",
            Stage::Built => "built",
            Stage::Submitted => "submitted",
            Stage::Recorded => "recorded",
        };
        f.write_str(name)
    }
}

/// Terminal state of a row.
#[derive(Debug)]
pub enum RowState {
    Skipped,
    Recorded { receipt: Receipt },
    /// `stage` is the state the row failed from; a malformed row fails from
    /// `Validated`, the check that rejected it.
    Failed { stage: Stage, error: RowError },
}

impl RowState {
    /// Text for the outcome cell; skipped rows write nothing.
    pub fn outcome(&self) -> Option<String> {
        match self {
            RowState::Skipped => None,
            RowState::Recorded { receipt } => Some(receipt.cid.clone()),
            RowState::Failed { error, .. } => Some(error.to_string()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RowState::Skipped => "skipped",
            RowState::Recorded { .. } => "recorded",
            RowState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug)]
pub struct RowReport {
    pub index: usize,
    /// Outcome cell written for this row, if any.
    pub cell: Option<String>,
    pub state: RowState,
}

type StageError = (Stage, RowError);

pub struct RowProcessor<L> {
    builder: GrantRequestBuilder,
    submitter: GrantSubmitter<L>,
    policy: AllowancePolicy,
}

impl<L: LedgerClient> RowProcessor<L> {
    pub fn new(builder: GrantRequestBuilder, submitter: GrantSubmitter<L>, policy: AllowancePolicy) -> Self {
        Self {
            builder,
            submitter,
            policy,
        }
    }

    /// Drive one row to a terminal state. Only a failed write-back is
    /// returned as an error; every other failure becomes the row's outcome.
    pub fn process<S: RowStore>(
        &mut self,
        index: usize,
        cells: Vec<String>,
        sheet: &mut Worksheet<S>,
    ) -> Result<RowReport, BatchError> {
        debug!(row = index, cells = ?cells, "fetched");
        let state = match Row::parse(index, cells) {
            Ok(ParsedRow::AlreadyProcessed) => {
                return Ok(RowReport {
                    index,
                    cell: None,
                    state: RowState::Skipped,
                })
            }
            Ok(ParsedRow::Pending(row)) => match self.grant(&row) {
                Ok(receipt) => RowState::Recorded { receipt },
                Err((stage, error)) => RowState::Failed { stage, error },
            },
            Err(error) => RowState::Failed {
                stage: Stage::Validated,
                error,
            },
        };

        let outcome = state.outcome().unwrap_or_default();
        let cell = sheet.write_outcome(index, &outcome)?;
        Ok(RowReport {
            index,
            cell: Some(cell),
            state,
        })
    }

    fn grant(&mut self, row: &Row) -> Result<Receipt, StageError> {
        let client = self.resolve(row)?;
        let allowance = self
            .policy
            .parse(&row.amount)
            .map_err(|e| (Stage::Resolved, RowError::from(e)))?;
        info!(
            row = row.index,
            from = %self.builder.operator(),
            to = %client,
            allowance = allowance.base_units(),
            "granting allowance"
        );
        let msg = self
            .builder
            .build(&client, allowance)
            .map_err(|e| (Stage::Resolved, RowError::from(e)))?;
        self.submit(row, &msg, allowance)
    }

    fn resolve(&self, row: &Row) -> Result<Address, StageError> {
        address::resolve(&row.identity).map_err(|e| {
            warn!(row = row.index, identity = %row.identity, error = %e, "cannot resolve requester");
            (Stage::Validated, RowError::from(e))
        })
    }

    fn submit(
        &mut self,
        row: &Row,
        msg: &Message,
        allowance: Allowance,
    ) -> Result<Receipt, StageError> {
        let receipt = self
            .submitter
            .submit(msg)
            .map_err(|e| (Stage::Built, RowError::from(e)))?;
        debug!(
            row = row.index,
            cid = %receipt.cid,
            nonce = ?receipt.nonce,
            allowance = allowance.base_units(),
            "message pushed"
        );
        Ok(receipt)
    }
}
