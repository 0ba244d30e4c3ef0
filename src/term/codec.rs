use super::{Pid, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const VERSION: u8 = 131;

const NEW_PID_EXT: u8 = 88;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const PID_EXT: u8 = 103;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

// deepest nesting of tuples and lists accepted from a peer
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("unsupported term format version: {0}")]
    Version(u8),
    #[error("unsupported term tag: {0}")]
    Tag(u8),
    #[error("term truncated")]
    Truncated,
    #[error("improper lists are not supported")]
    ImproperList,
    #[error("atom is not valid utf-8")]
    InvalidAtom,
    #[error("expected an atom for the pid node name")]
    InvalidPid,
    #[error("term nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("{0} trailing bytes after term")]
    TrailingBytes(usize),
}

pub fn encode(term: &Term) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(VERSION);
    encode_term(term, &mut buf);
    buf.freeze()
}

pub fn decode(mut data: &[u8]) -> Result<Term, CodecError> {
    need(data, 1)?;
    let version = data.get_u8();
    if version != VERSION {
        return Err(CodecError::Version(version));
    }
    let term = decode_term(&mut data, 0)?;
    if !data.is_empty() {
        return Err(CodecError::TrailingBytes(data.len()));
    }
    Ok(term)
}

fn encode_term(term: &Term, buf: &mut BytesMut) {
    match term {
        Term::Atom(name) => encode_atom(name, buf),
        Term::Integer(v) => encode_integer(*v, buf),
        Term::BigInteger {
            negative,
            magnitude,
        } => encode_big(*negative, magnitude, buf),
        Term::Binary(data) => {
            buf.put_u8(BINARY_EXT);
            buf.put_u32(data.len() as u32);
            buf.put_slice(data);
        }
        Term::String(bytes) => {
            if bytes.is_empty() {
                buf.put_u8(NIL_EXT);
            } else if bytes.len() <= u16::MAX as usize {
                buf.put_u8(STRING_EXT);
                buf.put_u16(bytes.len() as u16);
                buf.put_slice(bytes);
            } else {
                // too long for STRING_EXT, send as a list of small integers
                buf.put_u8(LIST_EXT);
                buf.put_u32(bytes.len() as u32);
                for b in bytes {
                    buf.put_u8(SMALL_INTEGER_EXT);
                    buf.put_u8(*b);
                }
                buf.put_u8(NIL_EXT);
            }
        }
        Term::List(items) => {
            if items.is_empty() {
                buf.put_u8(NIL_EXT);
            } else {
                buf.put_u8(LIST_EXT);
                buf.put_u32(items.len() as u32);
                for item in items {
                    encode_term(item, buf);
                }
                buf.put_u8(NIL_EXT);
            }
        }
        Term::Tuple(items) => {
            if items.len() <= u8::MAX as usize {
                buf.put_u8(SMALL_TUPLE_EXT);
                buf.put_u8(items.len() as u8);
            } else {
                buf.put_u8(LARGE_TUPLE_EXT);
                buf.put_u32(items.len() as u32);
            }
            for item in items {
                encode_term(item, buf);
            }
        }
        Term::Pid(pid) => {
            buf.put_u8(NEW_PID_EXT);
            encode_atom(pid.node(), buf);
            buf.put_u32(pid.id());
            buf.put_u32(pid.serial());
            buf.put_u32(pid.creation());
        }
    }
}

fn encode_atom(name: &str, buf: &mut BytesMut) {
    if name.len() <= u8::MAX as usize {
        buf.put_u8(SMALL_ATOM_UTF8_EXT);
        buf.put_u8(name.len() as u8);
    } else {
        buf.put_u8(ATOM_UTF8_EXT);
        buf.put_u16(name.len() as u16);
    }
    buf.put_slice(name.as_bytes());
}

fn encode_integer(v: i64, buf: &mut BytesMut) {
    if (0..=u8::MAX as i64).contains(&v) {
        buf.put_u8(SMALL_INTEGER_EXT);
        buf.put_u8(v as u8);
    } else if let Ok(v) = i32::try_from(v) {
        buf.put_u8(INTEGER_EXT);
        buf.put_i32(v);
    } else {
        let magnitude = v.unsigned_abs().to_le_bytes();
        let len = magnitude.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        encode_big(v < 0, &magnitude[..len], buf);
    }
}

fn encode_big(negative: bool, magnitude: &[u8], buf: &mut BytesMut) {
    if magnitude.len() <= u8::MAX as usize {
        buf.put_u8(SMALL_BIG_EXT);
        buf.put_u8(magnitude.len() as u8);
    } else {
        buf.put_u8(LARGE_BIG_EXT);
        buf.put_u32(magnitude.len() as u32);
    }
    buf.put_u8(negative as u8);
    buf.put_slice(magnitude);
}

fn need(data: &[u8], n: usize) -> Result<(), CodecError> {
    if data.len() < n {
        Err(CodecError::Truncated)
    } else {
        Ok(())
    }
}

fn take(data: &mut &[u8], n: usize) -> Result<Vec<u8>, CodecError> {
    need(data, n)?;
    let (head, rest) = data.split_at(n);
    *data = rest;
    Ok(head.to_vec())
}

fn decode_term(data: &mut &[u8], depth: usize) -> Result<Term, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    need(data, 1)?;
    let tag = data.get_u8();
    match tag {
        SMALL_INTEGER_EXT => {
            need(data, 1)?;
            Ok(Term::Integer(data.get_u8() as i64))
        }
        INTEGER_EXT => {
            need(data, 4)?;
            Ok(Term::Integer(data.get_i32() as i64))
        }
        SMALL_BIG_EXT => {
            need(data, 1)?;
            let n = data.get_u8() as usize;
            decode_big(data, n)
        }
        LARGE_BIG_EXT => {
            need(data, 4)?;
            let n = data.get_u32() as usize;
            decode_big(data, n)
        }
        ATOM_EXT | SMALL_ATOM_EXT | ATOM_UTF8_EXT | SMALL_ATOM_UTF8_EXT => {
            decode_atom_body(tag, data).map(Term::Atom)
        }
        SMALL_TUPLE_EXT | LARGE_TUPLE_EXT => {
            let arity = if tag == SMALL_TUPLE_EXT {
                need(data, 1)?;
                data.get_u8() as usize
            } else {
                need(data, 4)?;
                data.get_u32() as usize
            };
            // every element takes at least one byte
            need(data, arity)?;
            let mut items = Vec::with_capacity(arity);
            for _ in 0..arity {
                items.push(decode_term(data, depth + 1)?);
            }
            Ok(Term::Tuple(items))
        }
        NIL_EXT => Ok(Term::List(Vec::new())),
        STRING_EXT => {
            need(data, 2)?;
            let len = data.get_u16() as usize;
            Ok(Term::String(take(data, len)?))
        }
        LIST_EXT => {
            need(data, 4)?;
            let len = data.get_u32() as usize;
            need(data, len)?;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_term(data, depth + 1)?);
            }
            match decode_term(data, depth + 1)? {
                Term::List(tail) if tail.is_empty() => Ok(Term::List(items)),
                _ => Err(CodecError::ImproperList),
            }
        }
        BINARY_EXT => {
            need(data, 4)?;
            let len = data.get_u32() as usize;
            Ok(Term::Binary(take(data, len)?.into()))
        }
        PID_EXT | NEW_PID_EXT => {
            let node = match decode_term(data, depth + 1)? {
                Term::Atom(node) => node,
                _ => return Err(CodecError::InvalidPid),
            };
            need(data, 8)?;
            let id = data.get_u32();
            let serial = data.get_u32();
            let creation = if tag == PID_EXT {
                need(data, 1)?;
                data.get_u8() as u32
            } else {
                need(data, 4)?;
                data.get_u32()
            };
            Ok(Term::Pid(Pid::new(node, id, serial, creation)))
        }
        other => Err(CodecError::Tag(other)),
    }
}

fn decode_atom_body(tag: u8, data: &mut &[u8]) -> Result<String, CodecError> {
    let len = match tag {
        SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
            need(data, 1)?;
            data.get_u8() as usize
        }
        _ => {
            need(data, 2)?;
            data.get_u16() as usize
        }
    };
    let raw = take(data, len)?;
    match tag {
        // latin-1 maps one byte to one code point
        ATOM_EXT | SMALL_ATOM_EXT => Ok(raw.iter().map(|b| *b as char).collect()),
        _ => String::from_utf8(raw).map_err(|_| CodecError::InvalidAtom),
    }
}

fn decode_big(data: &mut &[u8], n: usize) -> Result<Term, CodecError> {
    need(data, 1)?;
    let negative = data.get_u8() != 0;
    let mut magnitude = take(data, n)?;
    while magnitude.last() == Some(&0) {
        magnitude.pop();
    }
    if magnitude.len() <= 8 {
        let mut raw = [0u8; 8];
        raw[..magnitude.len()].copy_from_slice(&magnitude);
        let unsigned = u64::from_le_bytes(raw);
        let value = if negative {
            // -(2^63) is the only magnitude above i64::MAX that still fits
            if unsigned <= i64::MAX as u64 {
                Some(-(unsigned as i64))
            } else if unsigned == i64::MAX as u64 + 1 {
                Some(i64::MIN)
            } else {
                None
            }
        } else {
            i64::try_from(unsigned).ok()
        };
        if let Some(v) = value {
            return Ok(Term::Integer(v));
        }
    }
    Ok(Term::BigInteger {
        negative,
        magnitude,
    })
}
