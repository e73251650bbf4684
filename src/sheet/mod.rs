//! Spreadsheet side of the run: where pending requests come from and where
//! outcomes go back to.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::error::BatchError;
use crate::retry::RetryPolicy;

pub mod credentials;

pub use credentials::{Credentials, CredentialsError};

pub const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const DEFAULT_SHEET: &str = "Form Responses 1";
pub const DEFAULT_FIRST_ROW: u32 = 2;

/// Column holding the outcome; cells after it are never read.
pub const OUTCOME_COLUMN: char = 'D';

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("sheet service unreachable: {0}")]
    Transport(String),
    #[error("sheet service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decoding sheet response: {0}")]
    Decode(String),
    #[error("building sheet url: {0}")]
    Url(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Status { status, .. } => *status == 429 || *status >= 500,
            StoreError::Decode(_) | StoreError::Url(_) => false,
        }
    }
}

pub trait RowStore {
    fn fetch_rows(&mut self, source: &str, range: &str) -> Result<Vec<Vec<String>>, StoreError>;
    fn update_cell(&mut self, source: &str, cell: &str, value: &str) -> Result<(), StoreError>;
}

impl<S: RowStore + ?Sized> RowStore for &mut S {
    fn fetch_rows(&mut self, source: &str, range: &str) -> Result<Vec<Vec<String>>, StoreError> {
        (**self).fetch_rows(source, range)
    }

    fn update_cell(&mut self, source: &str, cell: &str, value: &str) -> Result<(), StoreError> {
        (**self).update_cell(source, cell, value)
    }
}

/// Maps row positions to A1 ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SheetLayout {
    pub sheet: String,
    pub first_row: u32,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            sheet: DEFAULT_SHEET.to_string(),
            first_row: DEFAULT_FIRST_ROW,
        }
    }
}

impl SheetLayout {
    pub fn read_range(&self) -> String {
        format!("{}!A{}:{OUTCOME_COLUMN}", self.sheet, self.first_row)
    }

    /// Outcome cell of the `index`-th fetched row.
    pub fn outcome_cell(&self, index: usize) -> String {
        format!(
            "{}!{OUTCOME_COLUMN}{}",
            self.sheet,
            index as u64 + u64::from(self.first_row)
        )
    }
}

/// One spreadsheet, bound to a store and the layout of its request sheet.
pub struct Worksheet<S> {
    store: S,
    spreadsheet: String,
    layout: SheetLayout,
    retry: RetryPolicy,
}

impl<S: RowStore> Worksheet<S> {
    pub fn new(store: S, spreadsheet: impl Into<String>, layout: SheetLayout, retry: RetryPolicy) -> Self {
        Self {
            store,
            spreadsheet: spreadsheet.into(),
            layout,
            retry,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn fetch_rows(&mut self) -> Result<Vec<Vec<String>>, BatchError> {
        let range = self.layout.read_range();
        self.store
            .fetch_rows(&self.spreadsheet, &range)
            .map_err(|source| BatchError::Fetch {
                spreadsheet: self.spreadsheet.clone(),
                range,
                source,
            })
    }

    /// Write `value` into the outcome cell of row `index`, retrying transient
    /// failures. Returns the cell that was written.
    pub fn write_outcome(&mut self, index: usize, value: &str) -> Result<String, BatchError> {
        let cell = self.layout.outcome_cell(index);
        let store = &mut self.store;
        let spreadsheet = self.spreadsheet.as_str();
        let result = self.retry.retry(
            |attempt| {
                if attempt > 0 {
                    warn!(attempt, cell = %cell, "retrying outcome write");
                }
                store.update_cell(spreadsheet, &cell, value)
            },
            StoreError::is_transient,
        );
        match result {
            Ok(()) => Ok(cell),
            Err(source) => Err(BatchError::WriteBack { cell, source }),
        }
    }
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn decode_value_range(body: &str) -> Result<Vec<Vec<String>>, StoreError> {
    let range: ValueRange =
        serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(range
        .values
        .into_iter()
        .map(|row| row.into_iter().map(cell_text).collect())
        .collect())
}

/// Google Sheets v4 values API.
pub struct SheetsClient {
    agent: ureq::Agent,
    base: Url,
    access_token: String,
}

impl SheetsClient {
    pub fn new(access_token: String, timeout: Duration) -> Result<Self, StoreError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self::with_agent(agent, SHEETS_API, access_token)
    }

    pub fn with_agent(agent: ureq::Agent, base: &str, access_token: String) -> Result<Self, StoreError> {
        let base = Url::parse(base).map_err(|e| StoreError::Url(e.to_string()))?;
        Ok(Self {
            agent,
            base,
            access_token,
        })
    }

    fn values_url(&self, source: &str, range: &str) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Url(format!("{} cannot take a path", self.base)))?
            .push(source)
            .push("values")
            .push(range);
        Ok(url)
    }

    fn send(&self, request: ureq::Request, body: Option<Value>) -> Result<String, StoreError> {
        let request = request.set("Authorization", &format!("Bearer {}", self.access_token));
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        match result {
            Ok(response) => response
                .into_string()
                .map_err(|e| StoreError::Decode(e.to_string())),
            Err(ureq::Error::Status(status, response)) => Err(StoreError::Status {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(transport)) => Err(StoreError::Transport(transport.to_string())),
        }
    }
}

impl RowStore for SheetsClient {
    fn fetch_rows(&mut self, source: &str, range: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let url = self.values_url(source, range)?;
        debug!(%url, "fetching rows");
        let body = self.send(self.agent.get(url.as_str()), None)?;
        decode_value_range(&body)
    }

    fn update_cell(&mut self, source: &str, cell: &str, value: &str) -> Result<(), StoreError> {
        let mut url = self.values_url(source, cell)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        debug!(%url, "updating cell");
        let body = json!({
            "range": cell,
            "majorDimension": "ROWS",
            "values": [[value]],
        });
        self.send(self.agent.put(url.as_str()), Some(body))?;
        Ok(())
    }
}
