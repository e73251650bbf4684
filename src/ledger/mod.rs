use tracing::warn;

use crate::grant::Message;
use crate::retry::RetryPolicy;

pub mod lotus;

pub use lotus::{ApiInfo, ApiInfoError, LotusClient};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The request never reached the node.
    #[error("node unreachable: {0}")]
    Transport(String),
    /// The push was sent but no answer came back; the node may hold it.
    #[error("push unconfirmed, check the node mpool before granting again: {0}")]
    Unconfirmed(String),
    #[error("node returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{message} (code {code})")]
    Rpc { code: i64, message: String },
    #[error("decoding node response: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Only failures where the node cannot have seen the message are safe to
    /// push again; anything else, `Unconfirmed` included, may already sit in
    /// the mpool.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transport(_))
    }
}

/// What the node hands back for an accepted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub cid: String,
    pub nonce: Option<u64>,
}

pub trait LedgerClient {
    /// Sign with the `from` key, assign nonce and gas, and push to the mpool.
    fn push_message(&mut self, msg: &Message) -> Result<Receipt, LedgerError>;
}

impl<L: LedgerClient + ?Sized> LedgerClient for &mut L {
    fn push_message(&mut self, msg: &Message) -> Result<Receipt, LedgerError> {
        (**self).push_message(msg)
    }
}

pub struct GrantSubmitter<L> {
    client: L,
    retry: RetryPolicy,
}

impl<L: LedgerClient> GrantSubmitter<L> {
    pub fn new(client: L, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &L {
        &self.client
    }

    pub fn into_client(self) -> L {
        self.client
    }

    pub fn submit(&mut self, msg: &Message) -> Result<Receipt, LedgerError> {
        let client = &mut self.client;
        self.retry.retry(
            |attempt| {
                if attempt > 0 {
                    warn!(attempt, to = %msg.to, "retrying message push");
                }
                client.push_message(msg)
            },
            LedgerError::is_transient,
        )
    }
}
