use serde_cbor::Value;
use tracing::warn;

use crate::address::Address;

/// Cells hold MiB; the registry counts bytes.
pub const ALLOWANCE_UNIT: u128 = 1024 * 1024;

/// Verified registry actor (`f06`).
pub const VERIFIED_REGISTRY_ACTOR_ID: u64 = 6;
pub const METHOD_ADD_VERIFIED_CLIENT: u64 = 4;

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("encoding params: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("encoding params: undefined client address")]
    UndefinedAddress,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("invalid allowance {0:?}: expected a whole number of MiB")]
pub struct InvalidAllowance(pub String);

/// DataCap quantity in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Allowance(u128);

impl Allowance {
    pub fn from_mib(mib: u64) -> Self {
        Allowance(u128::from(mib) * ALLOWANCE_UNIT)
    }

    pub fn base_units(self) -> u128 {
        self.0
    }

    /// Filecoin big-int wire form: empty for zero, else a `0x00` sign byte and
    /// the big-endian magnitude.
    pub fn to_bigint_bytes(self) -> Vec<u8> {
        let be = self.0.to_be_bytes();
        match be.iter().position(|b| *b != 0) {
            None => Vec::new(),
            Some(first) => {
                let mut out = Vec::with_capacity(be.len() - first + 1);
                out.push(0x00);
                out.extend_from_slice(&be[first..]);
                out
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllowancePolicy {
    /// Unparseable amounts grant nothing rather than failing the row.
    #[default]
    Permissive,
    Strict,
}

impl AllowancePolicy {
    pub fn parse(self, cell: &str) -> Result<Allowance, InvalidAllowance> {
        let trimmed = cell.trim();
        let parsed = if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            trimmed.parse::<u64>().ok()
        } else {
            None
        };
        match (parsed, self) {
            (Some(mib), _) => Ok(Allowance::from_mib(mib)),
            (None, AllowancePolicy::Permissive) => {
                warn!(amount = cell, "amount is not a whole number, granting zero");
                Ok(Allowance::default())
            }
            (None, AllowancePolicy::Strict) => Err(InvalidAllowance(cell.to_string())),
        }
    }
}

/// `AddVerifiedClient` params, encoded as a CBOR tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddVerifiedClientParams {
    pub address: Address,
    pub allowance: Allowance,
}

impl AddVerifiedClientParams {
    pub fn to_cbor(&self) -> Result<Vec<u8>, EncodingError> {
        if self.address.is_undef() {
            return Err(EncodingError::UndefinedAddress);
        }
        let tuple = Value::Array(vec![
            Value::Bytes(self.address.as_bytes().to_vec()),
            Value::Bytes(self.allowance.to_bigint_bytes()),
        ]);
        Ok(serde_cbor::to_vec(&tuple)?)
    }
}

/// Unsigned outbound message; the node fills nonce and gas on push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub version: u64,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub value: u128,
    pub method: u64,
    pub params: Vec<u8>,
}

pub fn verified_registry() -> Address {
    Address::new_id(VERIFIED_REGISTRY_ACTOR_ID)
}

pub struct GrantRequestBuilder {
    operator: Address,
}

impl GrantRequestBuilder {
    pub fn new(operator: Address) -> Self {
        Self { operator }
    }

    pub fn operator(&self) -> &Address {
        &self.operator
    }

    pub fn build(&self, client: &Address, allowance: Allowance) -> Result<Message, EncodingError> {
        let params = AddVerifiedClientParams {
            address: client.clone(),
            allowance,
        }
        .to_cbor()?;
        Ok(Message {
            version: 0,
            from: self.operator.clone(),
            to: verified_registry(),
            nonce: 0,
            value: 0,
            method: METHOD_ADD_VERIFIED_CLIENT,
            params,
        })
    }
}
