use crate::term::Term;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    OkDetail(String),
    Error(String),
}

impl Reply {
    pub fn found(found: bool) -> Self {
        Self::OkDetail(if found { "found" } else { "notfound" }.into())
    }

    pub fn to_term(&self) -> Term {
        match self {
            Self::Ok => Term::atom("ok"),
            Self::OkDetail(detail) => Term::tuple(vec![Term::atom("ok"), Term::atom(detail)]),
            Self::Error(reason) => Term::tuple(vec![Term::atom("error"), Term::string(reason)]),
        }
    }
}
