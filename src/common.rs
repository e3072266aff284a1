use hex::{FromHex, ToHex};
use once_cell::sync::OnceCell;
pub use primitive_types::U256;
use primitive_types::{H160, H256};
use serde::{
    de::{self, Deserialize, Deserializer, Visitor},
    Serialize, Serializer,
};
use sha3::Digest;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Amount of the native coin. Wrapped so it carries its own RLP and JSON encodings.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Default, Debug)]
pub struct Amount(U256);

/// Account address. `contract` selects the `cx` (contract) or `hx` (externally owned) space.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Addr {
    contract: bool,
    id: H160,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Hash(H256);

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytes(Vec<u8>);

/// Block timestamps and transaction timestamps are in microseconds.
pub type Timestamp = i64;

pub fn now_micros() -> Timestamp {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as Timestamp)
        .unwrap_or(0)
}

// Amount

impl Amount {
    #[inline(always)]
    pub fn checked_add(&self, other: &Amount) -> Option<Amount> {
        Some(Amount(self.0.checked_add(other.0)?))
    }

    #[inline(always)]
    pub fn checked_sub(&self, other: &Amount) -> Option<Amount> {
        Some(Amount(self.0.checked_sub(other.0)?))
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Amount> = OnceCell::new();
        V.get_or_init(|| U256::zero().into())
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Minimal big-endian representation (empty for zero).
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let mut buff = [0u8; 32];
        self.0.to_big_endian(&mut buff);
        let skip = 32 - (self.0.bits() + 7) / 8;
        buff[skip..].to_vec()
    }
}

impl From<U256> for Amount {
    fn from(u: U256) -> Self {
        Self(u)
    }
}

impl From<u64> for Amount {
    fn from(u: u64) -> Self {
        Self(u.into())
    }
}

impl From<Amount> for U256 {
    fn from(a: Amount) -> Self {
        a.0
    }
}

impl AsRef<U256> for Amount {
    fn as_ref(&self) -> &U256 {
        &self.0
    }
}

impl FromStr for Amount {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(U256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::LowerHex for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:x}", &self))
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(deserializer.deserialize_str(U256Visitor)?.into())
    }
}

// Addr

impl Addr {
    pub const LEN: usize = 21;

    pub fn new(contract: bool, id: [u8; 20]) -> Self {
        Self {
            contract,
            id: H160(id),
        }
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Addr> = OnceCell::new();
        V.get_or_init(Addr::default)
    }

    /// Address of an externally owned account, derived from an uncompressed public key.
    pub fn from_public_key(pubkey: &[u8; 65]) -> Self {
        let digest = sha3::Sha3_256::digest(&pubkey[1..]);
        Self {
            contract: false,
            id: H160::from_slice(&digest.as_slice()[12..]),
        }
    }

    /// Address of a contract deployed by `from` with the given deploy transaction.
    pub fn for_contract(from: &Addr, deploy_tx: &Hash) -> Self {
        let mut hasher = sha3::Sha3_256::new();
        hasher.update(from.as_bytes());
        hasher.update(deploy_tx.as_bytes());
        Self {
            contract: true,
            id: H160::from_slice(&hasher.finalize().as_slice()[12..]),
        }
    }

    #[inline(always)]
    pub fn is_contract(&self) -> bool {
        self.contract
    }

    #[inline(always)]
    pub fn id(&self) -> &[u8] {
        self.id.as_bytes()
    }

    /// 21-byte form: the space flag followed by the account id.
    pub fn as_bytes(&self) -> [u8; 21] {
        let mut buff = [0u8; 21];
        buff[0] = self.contract as u8;
        buff[1..].copy_from_slice(self.id.as_bytes());
        buff
    }

    pub fn from_slice(s: &[u8]) -> Option<Self> {
        match s.len() {
            20 => Some(Self {
                contract: false,
                id: H160::from_slice(s),
            }),
            21 if s[0] <= 1 => Some(Self {
                contract: s[0] == 1,
                id: H160::from_slice(&s[1..]),
            }),
            _ => None,
        }
    }
}

impl FromStr for Addr {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        if s.len() != 42 {
            return Err(())
        }
        let contract = match &s[..2] {
            "hx" => false,
            "cx" => true,
            _ => return Err(()),
        };
        let id = <[u8; 20]>::from_hex(&s[2..]).map_err(|_| ())?;
        Ok(Self::new(contract, id))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            if self.contract { "cx" } else { "hx" },
            self.id.as_bytes().encode_hex::<String>()
        )
    }
}

impl Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(AddrVisitor)
    }
}

struct AddrVisitor;

impl<'de> Visitor<'de> for AddrVisitor {
    type Value = Addr;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("`hx` or `cx` followed by 40 hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<Addr, E>
    where
        E: de::Error,
    {
        Addr::from_str(value).map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(value), &self)
        })
    }
}

// Hash

impl Hash {
    /// SHA3-256 of the given bytes; every content address in the crate goes through here.
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self::from_slice(sha3::Sha3_256::digest(slice).as_slice())
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| Self(H256::zero()))
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H256::from_slice(s))
    }

    #[inline(always)]
    pub fn to_fixed_bytes(&self) -> [u8; 32] {
        self.0.to_fixed_bytes()
    }

    pub fn try_from_slice(s: &[u8]) -> Option<Self> {
        if s.len() == 32 {
            Some(Self::from_slice(s))
        } else {
            None
        }
    }
}

impl From<[u8; 32]> for Hash {
    fn from(u: [u8; 32]) -> Self {
        Self(u.into())
    }
}

impl FromStr for Hash {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(H256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.0.as_bytes().encode_hex::<String>())
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BytesRef::serialize(&BytesRef(self.as_bytes()), serializer)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let bytes = deserializer.deserialize_str(BytesVisitor)?.0;
        Hash::try_from_slice(&bytes)
            .ok_or_else(|| D::Error::invalid_length(bytes.len(), &"32 bytes"))
    }
}

// Bytes

impl Bytes {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(s.into())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl std::borrow::Borrow<[u8]> for Bytes {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl rlp::Encodable for Bytes {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self)
    }
}

impl rlp::Decodable for Bytes {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(Self(bytes.to_vec())))
    }
}

impl Serialize for Bytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BytesRef::serialize(&BytesRef(self), serializer)
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(BytesVisitor)
    }
}

pub struct BytesRef<'a>(&'a [u8]);

impl<'a> From<&'a [u8]> for BytesRef<'a> {
    fn from(s: &'a [u8]) -> Self {
        Self(s)
    }
}

impl<'a> fmt::LowerHex for BytesRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.encode_hex::<String>())
    }
}

impl<'a> Serialize for BytesRef<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:x}", &self))
    }
}

pub struct BytesVisitor;

impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Bytes;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .write_str("starts with `0x` and has even number of hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<Bytes, E>
    where
        E: de::Error,
    {
        if value.len() < 2 {
            return Err(de::Error::invalid_length(value.len(), &self))
        }
        let bytes = value.as_bytes();
        if bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
            match Vec::from_hex(&value[2..]) {
                Ok(v) => Ok(v.into()),
                Err(_) => Err(de::Error::invalid_value(
                    de::Unexpected::Str(value),
                    &self,
                )),
            }
        } else {
            Err(de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }
}

pub struct U256Visitor;

impl<'de> Visitor<'de> for U256Visitor {
    type Value = U256;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string that starts with `0x` and has hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<U256, E>
    where
        E: de::Error,
    {
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .ok_or_else(|| {
                de::Error::invalid_value(de::Unexpected::Str(value), &self)
            })?;
        U256::from_str_radix(digits, 16).map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(value), &self)
        })
    }
}

pub struct I64Visitor;

impl<'de> Visitor<'de> for I64Visitor {
    type Value = i64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .write_str("a string that starts with `0x` and contains hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<i64, E>
    where
        E: de::Error,
    {
        let invalid = || -> E { de::Error::invalid_value(de::Unexpected::Str(value), &self) };
        let (neg, digits) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let digits = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .filter(|d| !d.is_empty())
            .ok_or_else(invalid)?;
        let mag = u64::from_str_radix(digits, 16).map_err(|_| invalid())?;
        if !neg {
            i64::try_from(mag).map_err(|_| invalid())
        } else if mag <= i64::MIN.unsigned_abs() {
            Ok((mag as i64).wrapping_neg())
        } else {
            Err(invalid())
        }
    }
}

/// Serde adapter for `0x`-prefixed hex integers, as used by the JSON transaction form. Negative
/// values carry a leading `-`.
pub mod hex_i64 {
    use super::*;

    pub fn serialize<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
        let sign = if *v < 0 { "-" } else { "" };
        s.serialize_str(&format!("{}0x{:x}", sign, v.unsigned_abs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        d.deserialize_str(I64Visitor)
    }
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_uint_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                let leading_empty_bytes = $size * 8 - (self.0.bits() + 7) / 8;
                let mut buffer = [0u8; $size * 8];
                self.0.to_big_endian(&mut buffer);
                s.encoder().encode_value(&buffer[leading_empty_bytes..]);
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    if !bytes.is_empty() && bytes[0] == 0 {
                        Err(rlp::DecoderError::RlpInvalidIndirection)
                    } else if bytes.len() <= $size * 8 {
                        Ok($wrapper_name($name::from(bytes)))
                    } else {
                        Err(rlp::DecoderError::RlpIsTooBig)
                    }
                })
            }
        }
    };
}

impl_wrapped_uint_rlp!(U256, Amount, 4);

impl rlp::Encodable for Hash {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self.0.as_ref());
    }
}

impl rlp::Decodable for Hash {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| match bytes.len().cmp(&32) {
            core::cmp::Ordering::Less => Err(rlp::DecoderError::RlpIsTooShort),
            core::cmp::Ordering::Greater => Err(rlp::DecoderError::RlpIsTooBig),
            core::cmp::Ordering::Equal => Ok(Hash::from_slice(bytes)),
        })
    }
}

impl rlp::Encodable for Addr {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(&self.as_bytes());
    }
}

impl rlp::Decodable for Addr {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| match bytes.len().cmp(&21) {
            core::cmp::Ordering::Less => Err(rlp::DecoderError::RlpIsTooShort),
            core::cmp::Ordering::Greater => Err(rlp::DecoderError::RlpIsTooBig),
            core::cmp::Ordering::Equal => Addr::from_slice(bytes)
                .ok_or(rlp::DecoderError::Custom("invalid address space")),
        })
    }
}

/// Optional hash encoded as empty data when absent (used for nullable tx hashes).
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct NullableHash(pub Option<Hash>);

impl rlp::Encodable for NullableHash {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(match &self.0 {
            Some(h) => h.as_bytes(),
            None => &[],
        });
    }
}

impl rlp::Decodable for NullableHash {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            if bytes.is_empty() {
                Ok(NullableHash(None))
            } else {
                Hash::try_from_slice(bytes)
                    .map(|h| NullableHash(Some(h)))
                    .ok_or(rlp::DecoderError::RlpInvalidLength)
            }
        })
    }
}

impl From<Option<Hash>> for NullableHash {
    fn from(h: Option<Hash>) -> Self {
        Self(h)
    }
}

#[test]
fn test_addr_text_form() {
    let a = Addr::from_str("hx6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0").unwrap();
    assert!(!a.is_contract());
    assert_eq!(a.to_string(), "hx6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0");
    let c = Addr::from_str("cx0000000000000000000000000000000000000001").unwrap();
    assert!(c.is_contract());
    assert_eq!(Addr::from_slice(&c.as_bytes()), Some(c));
    assert!(Addr::from_str("0x6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0").is_err());
}

#[test]
fn test_amount_rlp_is_minimal() {
    let a: Amount = 0x0102u64.into();
    assert_eq!(rlp::encode(&a).to_vec(), vec![0x82, 0x01, 0x02]);
    assert_eq!(rlp::decode::<Amount>(&rlp::encode(&a)).unwrap(), a);
    assert_eq!(Amount::zero().to_be_bytes(), Vec::<u8>::new());
}

#[test]
fn test_hex_i64_sign() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Height(#[serde(with = "hex_i64")] i64);

    for v in [0, 1, 0x1f, -1, -0x1f, i64::MAX, i64::MIN] {
        let js = serde_json::to_string(&Height(v)).unwrap();
        assert_eq!(serde_json::from_str::<Height>(&js).unwrap(), Height(v));
    }
    assert_eq!(serde_json::to_string(&Height(-2)).unwrap(), "\"-0x2\"");
    for bad in ["\"0x\"", "\"-0x8000000000000001\"", "\"0x8000000000000000\"", "\"12\""] {
        assert!(serde_json::from_str::<Height>(bad).is_err());
    }
}
