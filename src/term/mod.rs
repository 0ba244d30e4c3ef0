use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

mod codec;

pub use codec::{decode, encode, CodecError};

/// A process identifier. Pids are never reused for the lifetime of the node
/// that minted them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Pid {
    node: Arc<str>,
    id: u32,
    serial: u32,
    creation: u32,
}

impl Pid {
    pub fn new(node: impl Into<Arc<str>>, id: u32, serial: u32, creation: u32) -> Self {
        Self {
            node: node.into(),
            id,
            serial,
            creation,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn creation(&self) -> u32 {
        self.creation
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}.{}>", self.node, self.id, self.serial)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    Atom(String),
    Integer(i64),
    /// An integer that does not fit in an `i64`. Magnitude is little-endian.
    BigInteger { negative: bool, magnitude: Vec<u8> },
    Binary(Bytes),
    /// A list of bytes, as produced for string literals.
    String(Vec<u8>),
    List(Vec<Term>),
    Tuple(Vec<Term>),
    Pid(Pid),
}

impl Term {
    pub fn atom(name: &str) -> Self {
        Self::Atom(name.to_owned())
    }

    pub fn string(s: &str) -> Self {
        Self::String(s.as_bytes().to_vec())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    pub fn tuple(elements: impl Into<Vec<Term>>) -> Self {
        Self::Tuple(elements.into())
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Self::Tuple(elements) => Some(elements),
            _ => None,
        }
    }

    /// Lists, including the empty list. Byte strings are not lists here.
    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Self::List(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_pid(&self) -> Option<&Pid> {
        match self {
            Self::Pid(p) => Some(p),
            _ => None,
        }
    }

    /// A short name for the kind of term, used in decode error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Atom(_) => "atom",
            Self::Integer(_) | Self::BigInteger { .. } => "integer",
            Self::Binary(_) => "binary",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Pid(_) => "pid",
        }
    }
}

impl From<Pid> for Term {
    fn from(pid: Pid) -> Self {
        Self::Pid(pid)
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

fn write_separated(f: &mut fmt::Formatter<'_>, items: &[Term]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(a) => {
                let bare = a.chars().next().is_some_and(|c| c.is_ascii_lowercase())
                    && a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@');
                if bare {
                    f.write_str(a)
                } else {
                    write!(f, "'{}'", a.replace('\'', "\\'"))
                }
            }
            Self::Integer(v) => write!(f, "{v}"),
            Self::BigInteger {
                negative,
                magnitude,
            } => {
                // hex is enough for diagnostics
                f.write_str(if *negative { "-16#" } else { "16#" })?;
                for byte in magnitude.iter().rev() {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
            Self::Binary(b) => {
                if !b.is_empty() && b.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
                    write!(f, "<<\"{}\">>", String::from_utf8_lossy(b))
                } else {
                    f.write_str("<<")?;
                    for (i, byte) in b.iter().enumerate() {
                        if i > 0 {
                            f.write_str(",")?;
                        }
                        write!(f, "{byte}")?;
                    }
                    f.write_str(">>")
                }
            }
            Self::String(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            Self::List(items) => {
                f.write_str("[")?;
                write_separated(f, items)?;
                f.write_str("]")
            }
            Self::Tuple(items) => {
                f.write_str("{")?;
                write_separated(f, items)?;
                f.write_str("}")
            }
            Self::Pid(p) => write!(f, "{p}"),
        }
    }
}
