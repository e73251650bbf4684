//! Filecoin account identifiers and the resolver that turns a requester's
//! free-form identity cell into one.
//!
//! Two textual encodings are accepted:
//!
//! * native Filecoin strings (`f0…` through `f4…`, or the `t` testnet forms);
//! * Ethereum-style `0x…` hex addresses, converted through the Ethereum
//!   Address Manager the same way the node does.

use std::fmt;
use std::str::FromStr;

use blake2::{digest::consts::U4, Blake2b, Digest};
use data_encoding::BASE32_NOPAD;

pub const CHECKSUM_LEN: usize = 4;
pub const PAYLOAD_HASH_LEN: usize = 20;
pub const BLS_PUBLIC_KEY_LEN: usize = 48;
pub const MAX_SUBADDRESS_LEN: usize = 54;
pub const MAX_ADDRESS_STRING_LEN: usize = 2 + 84;
pub const ETH_ADDRESS_LEN: usize = 20;

/// Actor id of the Ethereum Address Manager; namespace of `f410f…` addresses.
pub const EAM_ACTOR_ID: u64 = 10;

/// Ids and namespaces are 63-bit on the ledger.
pub const MAX_ID: u64 = i64::MAX as u64;
const MAX_ID_STRING_LEN: usize = 19;
const UNDEF_STRING: &str = "<empty>";

type Blake2b32 = Blake2b<U4>;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum AddressError {
    #[error("invalid address length")]
    InvalidLength,
    #[error("unknown address network")]
    UnknownNetwork,
    #[error("unknown address protocol")]
    UnknownProtocol,
    #[error("invalid address payload")]
    InvalidPayload,
    #[error("invalid address checksum")]
    InvalidChecksum,
    #[error("invalid address encoding: {0}")]
    Base32(#[from] data_encoding::DecodeError),
    #[error("cannot parse hex value: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("eth address must be 20 bytes, got {0}")]
    EthLength(usize),
    #[error("IDs must be less than 2^63")]
    IdOutOfRange,
    #[error("invalid address")]
    Undefined,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Id = 0,
    Secp256k1 = 1,
    Actor = 2,
    Bls = 3,
    Delegated = 4,
}

impl Protocol {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Id),
            1 => Some(Self::Secp256k1),
            2 => Some(Self::Actor),
            3 => Some(Self::Bls),
            4 => Some(Self::Delegated),
            _ => None,
        }
    }

    fn from_digit(digit: u8) -> Option<Self> {
        digit
            .checked_sub(b'0')
            .and_then(Self::from_byte)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn prefix(self) -> char {
        match self {
            Network::Mainnet => 'f',
            Network::Testnet => 't',
        }
    }

    /// Network an address string was written for, judged by its first letter.
    pub fn of(s: &str) -> Option<Self> {
        match s.as_bytes().first() {
            Some(b'f') => Some(Network::Mainnet),
            Some(b't') => Some(Network::Testnet),
            _ => None,
        }
    }
}

/// Canonical ledger account identifier: protocol byte followed by payload.
///
/// The default value is the undefined address; it never comes out of
/// [`resolve`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Address {
    bytes: Vec<u8>,
}

impl Address {
    pub fn new_id(id: u64) -> Self {
        let mut bytes = vec![Protocol::Id as u8];
        write_uvarint(&mut bytes, id);
        Self { bytes }
    }

    pub fn new_delegated(namespace: u64, subaddress: &[u8]) -> Result<Self, AddressError> {
        if subaddress.len() > MAX_SUBADDRESS_LEN {
            return Err(AddressError::InvalidLength);
        }
        let mut bytes = vec![Protocol::Delegated as u8];
        write_uvarint(&mut bytes, namespace);
        bytes.extend_from_slice(subaddress);
        Ok(Self { bytes })
    }

    fn from_payload(protocol: Protocol, payload: &[u8]) -> Result<Self, AddressError> {
        let ok = match protocol {
            Protocol::Secp256k1 | Protocol::Actor => payload.len() == PAYLOAD_HASH_LEN,
            Protocol::Bls => payload.len() == BLS_PUBLIC_KEY_LEN,
            Protocol::Id | Protocol::Delegated => true,
        };
        if !ok {
            return Err(AddressError::InvalidPayload);
        }
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(protocol as u8);
        bytes.extend_from_slice(payload);
        Ok(Self { bytes })
    }

    pub fn is_undef(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.bytes.first().copied().and_then(Protocol::from_byte)
    }

    /// Wire form used inside message params.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        self.bytes.get(1..).unwrap_or_default()
    }

    /// Actor id for `f0` addresses.
    pub fn id(&self) -> Option<u64> {
        match self.protocol()? {
            Protocol::Id => read_uvarint(self.payload()).map(|(id, _)| id),
            _ => None,
        }
    }

    pub fn encode(&self, network: Network) -> String {
        let Some(protocol) = self.protocol() else {
            return UNDEF_STRING.to_string();
        };
        let mut out = String::with_capacity(MAX_ADDRESS_STRING_LEN);
        out.push(network.prefix());
        out.push(char::from(b'0' + protocol as u8));
        match protocol {
            Protocol::Id => {
                let id = self.id().unwrap_or_default();
                out.push_str(&id.to_string());
            }
            Protocol::Delegated => {
                let (namespace, used) = read_uvarint(self.payload()).unwrap_or_default();
                let subaddress = &self.payload()[used..];
                out.push_str(&namespace.to_string());
                out.push('f');
                out.push_str(&encode_base32(subaddress, &checksum(&self.bytes)));
            }
            Protocol::Secp256k1 | Protocol::Actor | Protocol::Bls => {
                out.push_str(&encode_base32(self.payload(), &checksum(&self.bytes)));
            }
        }
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode(Network::Mainnet))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == UNDEF_STRING {
            return Ok(Address::default());
        }
        if s.len() < 3 || s.len() > MAX_ADDRESS_STRING_LEN {
            return Err(AddressError::InvalidLength);
        }
        if Network::of(s).is_none() {
            return Err(AddressError::UnknownNetwork);
        }
        let protocol =
            Protocol::from_digit(s.as_bytes()[1]).ok_or(AddressError::UnknownProtocol)?;
        let raw = &s[2..];

        match protocol {
            Protocol::Id => Ok(Address::new_id(parse_decimal(raw)?)),
            Protocol::Delegated => {
                let (namespace, raw) = raw.split_once('f').ok_or(AddressError::InvalidPayload)?;
                let namespace = parse_decimal(namespace)?;
                let (subaddress, cksum) = split_checksum(&decode_base32(raw)?)?;
                if subaddress.len() > MAX_SUBADDRESS_LEN {
                    return Err(AddressError::InvalidPayload);
                }
                let address = Address::new_delegated(namespace, &subaddress)?;
                verify_checksum(&address.bytes, &cksum)?;
                Ok(address)
            }
            Protocol::Secp256k1 | Protocol::Actor | Protocol::Bls => {
                let (payload, cksum) = split_checksum(&decode_base32(raw)?)?;
                let address = Address::from_payload(protocol, &payload)?;
                verify_checksum(&address.bytes, &cksum)?;
                Ok(address)
            }
        }
    }
}

/// 20-byte Ethereum-style account address (`0x…`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EthAddress(pub [u8; ETH_ADDRESS_LEN]);

impl EthAddress {
    /// `0xff` followed by eleven zero bytes embeds an actor id in the last
    /// eight bytes.
    pub fn is_masked_id(&self) -> bool {
        self.0[0] == 0xff && self.0[1..12].iter().all(|b| *b == 0)
    }

    pub fn to_filecoin_address(&self) -> Result<Address, AddressError> {
        if self.is_masked_id() {
            let mut id = [0u8; 8];
            id.copy_from_slice(&self.0[12..]);
            let id = u64::from_be_bytes(id);
            if id > MAX_ID {
                return Err(AddressError::IdOutOfRange);
            }
            return Ok(Address::new_id(id));
        }
        Address::new_delegated(EAM_ACTOR_ID, &self.0)
    }
}

impl FromStr for EthAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let bytes = if digits.len() % 2 == 1 {
            hex::decode(format!("0{digits}"))?
        } else {
            hex::decode(digits)?
        };
        let bytes: [u8; ETH_ADDRESS_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::EthLength(bytes.len()))?;
        Ok(EthAddress(bytes))
    }
}

/// Identity cell classified by encoding, before any parsing happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressInput<'a> {
    Native(&'a str),
    Secondary(&'a str),
}

impl<'a> AddressInput<'a> {
    pub fn classify(identity: &'a str) -> Self {
        let identity = identity.trim();
        if identity.starts_with("0x") {
            AddressInput::Secondary(identity)
        } else {
            AddressInput::Native(identity)
        }
    }
}

/// Resolve a requester identity into a defined Filecoin address.
pub fn resolve(identity: &str) -> Result<Address, AddressError> {
    let address = match AddressInput::classify(identity) {
        AddressInput::Secondary(s) => s.parse::<EthAddress>()?.to_filecoin_address()?,
        AddressInput::Native(s) => s.parse::<Address>()?,
    };
    if address.is_undef() {
        return Err(AddressError::Undefined);
    }
    Ok(address)
}

fn parse_decimal(raw: &str) -> Result<u64, AddressError> {
    if raw.len() > MAX_ID_STRING_LEN {
        return Err(AddressError::InvalidLength);
    }
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::InvalidPayload);
    }
    let value: u64 = raw.parse().map_err(|_| AddressError::InvalidPayload)?;
    if value > MAX_ID {
        return Err(AddressError::IdOutOfRange);
    }
    Ok(value)
}

fn checksum(ingest: &[u8]) -> [u8; CHECKSUM_LEN] {
    Blake2b32::digest(ingest).into()
}

fn verify_checksum(ingest: &[u8], expected: &[u8]) -> Result<(), AddressError> {
    if checksum(ingest) != expected {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(())
}

fn split_checksum(decoded: &[u8]) -> Result<(Vec<u8>, Vec<u8>), AddressError> {
    if decoded.len() < CHECKSUM_LEN {
        return Err(AddressError::InvalidPayload);
    }
    let (payload, cksum) = decoded.split_at(decoded.len() - CHECKSUM_LEN);
    Ok((payload.to_vec(), cksum.to_vec()))
}

// Addresses use the lowercase RFC 4648 alphabet; the stock encoding is uppercase.
fn decode_base32(raw: &str) -> Result<Vec<u8>, AddressError> {
    if raw.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(AddressError::InvalidPayload);
    }
    Ok(BASE32_NOPAD.decode(raw.to_ascii_uppercase().as_bytes())?)
}

fn encode_base32(payload: &[u8], cksum: &[u8]) -> String {
    let mut buf = Vec::with_capacity(payload.len() + cksum.len());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(cksum);
    BASE32_NOPAD.encode(&buf).to_ascii_lowercase()
}

fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
