use super::decode::{self, DecodeError};
use crate::term::Term;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::collections::HashMap;

const LINE_LENGTH: usize = 76;

#[derive(Clone, Copy)]
enum Kind {
    Quorum,
    Binary,
}

type Schema = &'static [(&'static str, Kind)];

const GET_SCHEMA: Schema = &[
    ("r", Kind::Quorum),
    ("bucket", Kind::Binary),
    ("key", Kind::Binary),
];

const PUT_SCHEMA: Schema = &[
    ("bucket", Kind::Binary),
    ("key", Kind::Binary),
    ("value", Kind::Binary),
    ("w", Kind::Quorum),
    ("dw", Kind::Quorum),
    ("r", Kind::Quorum),
];

enum Value {
    Quorum(u32),
    Binary(Bytes),
}

// Absent integers are 0 and absent binaries empty; the last of repeated
// names wins.
struct Fields(HashMap<&'static str, Value>);

impl Fields {
    fn decode(args: &Term, schema: Schema) -> Result<Self, DecodeError> {
        let mut values = HashMap::new();
        for pair in decode::list(args)? {
            let pair = decode::tuple(pair, 2)?;
            let name = decode::atom(&pair[0])?;
            let Some(&(name, kind)) = schema.iter().find(|(n, _)| *n == name) else {
                continue;
            };
            let value = match kind {
                Kind::Quorum => Value::Quorum(decode::integer(&pair[1], name)?),
                Kind::Binary => Value::Binary(decode::binary(&pair[1])?.clone()),
            };
            values.insert(name, value);
        }
        Ok(Self(values))
    }

    fn quorum(&self, name: &str) -> u32 {
        match self.0.get(name) {
            Some(Value::Quorum(v)) => *v,
            _ => 0,
        }
    }

    fn binary(&self, name: &str) -> Bytes {
        match self.0.get(name) {
            Some(Value::Binary(b)) => b.clone(),
            _ => Bytes::new(),
        }
    }
}

/// Base64 in 76 column lines, each terminated by CRLF. Bucket and key names
/// go through this so arbitrary bytes survive every transport.
pub fn transport_safe(raw: &[u8]) -> String {
    let encoded = STANDARD.encode(raw);
    let mut out = String::with_capacity(encoded.len() + 2 * (encoded.len() / LINE_LENGTH + 1));
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(LINE_LENGTH));
        out.push_str(line);
        out.push_str("\r\n");
        rest = tail;
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub struct GetArgs {
    pub r: u32,
    pub bucket: String,
    pub key: String,
}

impl TryFrom<&Term> for GetArgs {
    type Error = DecodeError;

    fn try_from(args: &Term) -> Result<Self, Self::Error> {
        let fields = Fields::decode(args, GET_SCHEMA)?;
        Ok(Self {
            r: fields.quorum("r"),
            bucket: transport_safe(&fields.binary("bucket")),
            key: transport_safe(&fields.binary("key")),
        })
    }
}

/// Arguments for `put`, `create_update` and `update`. `r` applies to the
/// fetch that precedes a conditional write.
#[derive(Clone, Debug, PartialEq)]
pub struct PutArgs {
    pub bucket: String,
    pub key: String,
    pub value: Bytes,
    pub w: u32,
    pub dw: u32,
    pub r: u32,
}

impl TryFrom<&Term> for PutArgs {
    type Error = DecodeError;

    fn try_from(args: &Term) -> Result<Self, Self::Error> {
        let fields = Fields::decode(args, PUT_SCHEMA)?;
        Ok(Self {
            bucket: transport_safe(&fields.binary("bucket")),
            key: transport_safe(&fields.binary("key")),
            value: fields.binary("value"),
            w: fields.quorum("w"),
            dw: fields.quorum("dw"),
            r: fields.quorum("r"),
        })
    }
}
