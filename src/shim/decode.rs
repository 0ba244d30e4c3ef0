use crate::term::{Pid, Term};

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected}, got {found}")]
    Expected { expected: &'static str, found: String },
    #[error("{field} out of range: {value}")]
    Range { field: &'static str, value: String },
    #[error("unknown operation {0}")]
    UnknownOperation(String),
}

impl DecodeError {
    pub fn expected(expected: &'static str, found: &Term) -> Self {
        Self::Expected {
            expected,
            found: found.to_string(),
        }
    }
}

pub fn envelope(message: &Term) -> Result<(&Pid, &Term), DecodeError> {
    let elements = tuple(message, 2)?;
    Ok((pid(&elements[0])?, &elements[1]))
}

pub fn tuple(term: &Term, arity: usize) -> Result<&[Term], DecodeError> {
    match term.as_tuple() {
        Some(elements) if elements.len() == arity => Ok(elements),
        _ => Err(DecodeError::expected(tuple_name(arity), term)),
    }
}

fn tuple_name(arity: usize) -> &'static str {
    match arity {
        2 => "a 2-tuple",
        3 => "a 3-tuple",
        4 => "a 4-tuple",
        _ => "a tuple",
    }
}

pub fn atom(term: &Term) -> Result<&str, DecodeError> {
    term.as_atom()
        .ok_or_else(|| DecodeError::expected("an atom", term))
}

pub fn pid(term: &Term) -> Result<&Pid, DecodeError> {
    term.as_pid().ok_or_else(|| DecodeError::expected("a pid", term))
}

pub fn list(term: &Term) -> Result<&[Term], DecodeError> {
    term.as_list()
        .ok_or_else(|| DecodeError::expected("a list", term))
}

pub fn binary(term: &Term) -> Result<&Bytes, DecodeError> {
    term.as_binary()
        .ok_or_else(|| DecodeError::expected("a binary", term))
}

pub fn integer<T: TryFrom<i64>>(term: &Term, field: &'static str) -> Result<T, DecodeError> {
    match term {
        Term::Integer(v) => T::try_from(*v).map_err(|_| DecodeError::Range {
            field,
            value: v.to_string(),
        }),
        Term::BigInteger { .. } => Err(DecodeError::Range {
            field,
            value: term.to_string(),
        }),
        _ => Err(DecodeError::expected("an integer", term)),
    }
}
