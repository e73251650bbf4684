//! Batch DataCap notary.
//!
//! Reads allowance requests from a spreadsheet, grants each one through the
//! verified registry actor on a Filecoin node, and writes the pushed message
//! CID (or the reason the row failed) back next to the request.

pub mod address;
pub mod batch;
pub mod config;
pub mod error;
pub mod grant;
pub mod ledger;
pub mod retry;
pub mod row;
pub mod sheet;

pub use batch::{BatchRunner, RunSummary};
pub use error::{BatchError, RowError};
