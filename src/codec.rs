//! Tagged value codec.
//!
//! System variables and query results are stored as [TypedValue]s: a closed set of value kinds,
//! each with a one-byte tag and a byte payload. Containers nest by embedding the `(tag, payload)`
//! pair of every element in an RLP list, so the encoding is stable across restarts.

use std::collections::BTreeMap;

use num_traits::FromPrimitive;

use crate::common::{Addr, Amount, U256};
use crate::error::{Error, Result};

#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeTag {
    Null = 0,
    Bytes = 1,
    String = 2,
    List = 3,
    Map = 4,
    Bool = 5,
    Address = 10,
    Int = 11,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TypedValue {
    Null,
    Address(Addr),
    /// Non-negative integer, minimal big-endian on the wire.
    Int(U256),
    Bytes(Vec<u8>),
    Bool(bool),
    String(String),
    List(Vec<TypedValue>),
    Map(BTreeMap<String, TypedValue>),
}

impl TypedValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            TypedValue::Null => TypeTag::Null,
            TypedValue::Address(_) => TypeTag::Address,
            TypedValue::Int(_) => TypeTag::Int,
            TypedValue::Bytes(_) => TypeTag::Bytes,
            TypedValue::Bool(_) => TypeTag::Bool,
            TypedValue::String(_) => TypeTag::String,
            TypedValue::List(_) => TypeTag::List,
            TypedValue::Map(_) => TypeTag::Map,
        }
    }

    pub fn encode(&self) -> (TypeTag, Vec<u8>) {
        let payload = match self {
            TypedValue::Null => Vec::new(),
            TypedValue::Address(a) => a.as_bytes().to_vec(),
            TypedValue::Int(i) => Amount::from(*i).to_be_bytes(),
            TypedValue::Bytes(b) => b.clone(),
            TypedValue::Bool(b) => vec![*b as u8],
            TypedValue::String(s) => s.as_bytes().to_vec(),
            TypedValue::List(items) => {
                let mut s = rlp::RlpStream::new_list(items.len());
                for item in items {
                    item.append_to(&mut s);
                }
                s.out().to_vec()
            }
            TypedValue::Map(entries) => {
                let mut s = rlp::RlpStream::new_list(entries.len());
                for (k, v) in entries {
                    s.begin_list(2);
                    s.append(k);
                    v.append_to(&mut s);
                }
                s.out().to_vec()
            }
        };
        (self.tag(), payload)
    }

    pub fn decode(tag: u8, data: &[u8]) -> Result<Self> {
        let tag = TypeTag::from_u8(tag)
            .ok_or_else(|| Error::Codec(format!("InvalidTypeTag:{}", tag)))?;
        Ok(match tag {
            TypeTag::Null => TypedValue::Null,
            TypeTag::Address => TypedValue::Address(
                Addr::from_slice(data)
                    .ok_or_else(|| Error::Codec("InvalidAddress".into()))?,
            ),
            TypeTag::Int => {
                if data.len() > 32 {
                    return Err(Error::Codec("IntTooBig".into()))
                }
                TypedValue::Int(U256::from_big_endian(data))
            }
            TypeTag::Bytes => TypedValue::Bytes(data.to_vec()),
            TypeTag::Bool => match data {
                [0] => TypedValue::Bool(false),
                [1] => TypedValue::Bool(true),
                _ => return Err(Error::Codec("InvalidBool".into())),
            },
            TypeTag::String => TypedValue::String(
                String::from_utf8(data.to_vec())
                    .map_err(|e| Error::Codec(e.to_string()))?,
            ),
            TypeTag::List => {
                let r = rlp::Rlp::new(data);
                let mut items = Vec::with_capacity(r.item_count()?);
                for item in r.iter() {
                    items.push(Self::decode_from(&item)?);
                }
                TypedValue::List(items)
            }
            TypeTag::Map => {
                let r = rlp::Rlp::new(data);
                let mut entries = BTreeMap::new();
                for entry in r.iter() {
                    let key: String = entry.val_at(0)?;
                    entries.insert(key, Self::decode_from(&entry.at(1)?)?);
                }
                TypedValue::Map(entries)
            }
        })
    }

    fn append_to(&self, s: &mut rlp::RlpStream) {
        let (tag, payload) = self.encode();
        s.begin_list(2);
        s.append(&(tag as u8));
        s.append(&payload);
    }

    fn decode_from(r: &rlp::Rlp) -> Result<Self> {
        let tag: u8 = r.val_at(0)?;
        let payload: Vec<u8> = r.val_at(1)?;
        Self::decode(tag, &payload)
    }

    /// Self-describing form used for storage values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = rlp::RlpStream::new();
        self.append_to(&mut s);
        s.out().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode_from(&rlp::Rlp::new(bytes))
    }

    pub fn as_int(&self) -> Option<&U256> {
        match self {
            TypedValue::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(b) => Some(*b),
            TypedValue::Int(i) => Some(!i.is_zero()),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<&Addr> {
        match self {
            TypedValue::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            TypedValue::Null => Value::Null,
            TypedValue::Address(a) => Value::String(a.to_string()),
            TypedValue::Int(i) => Value::String(format!("0x{:x}", i)),
            TypedValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
            TypedValue::Bool(b) => Value::String(if *b { "0x1" } else { "0x0" }.into()),
            TypedValue::String(s) => Value::String(s.clone()),
            TypedValue::List(items) => {
                Value::Array(items.iter().map(|i| i.to_json()).collect())
            }
            TypedValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for TypedValue {
    fn from(b: bool) -> Self {
        TypedValue::Bool(b)
    }
}

impl From<u64> for TypedValue {
    fn from(i: u64) -> Self {
        TypedValue::Int(i.into())
    }
}

impl From<U256> for TypedValue {
    fn from(i: U256) -> Self {
        TypedValue::Int(i)
    }
}

impl From<Addr> for TypedValue {
    fn from(a: Addr) -> Self {
        TypedValue::Address(a)
    }
}

impl From<&str> for TypedValue {
    fn from(s: &str) -> Self {
        TypedValue::String(s.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_nested_values() {
        let addr = Addr::from_str("cx0000000000000000000000000000000000000001").unwrap();
        let mut m = BTreeMap::new();
        m.insert("owner".to_string(), TypedValue::Address(addr));
        m.insert("flags".to_string(), TypedValue::List(vec![true.into(), 7u64.into()]));
        let v = TypedValue::Map(m);
        let decoded = TypedValue::from_bytes(&v.to_bytes()).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn test_int_payload_is_minimal_big_endian() {
        let (tag, payload) = TypedValue::from(0x1234u64).encode();
        assert_eq!(tag, TypeTag::Int);
        assert_eq!(payload, vec![0x12, 0x34]);
        assert_eq!(TypedValue::from(0u64).encode().1, Vec::<u8>::new());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(TypedValue::decode(42, &[]), Err(Error::Codec(_))));
        assert!(TypedValue::decode(TypeTag::Bool as u8, &[2]).is_err());
    }
}
