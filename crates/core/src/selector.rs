//! Label and field selectors.
//!
//! Both follow the Kubernetes string forms:
//! - labels: `app=web,tier!=db,env in (prod,staging),release notin (canary),owner,!temp`
//! - fields: `involvedObject.kind=Pod,type!=Normal`
//!
//! Field selectors fail closed: a requirement on a field that the resource
//! kind does not expose matches nothing, for `=` and `!=` alike.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

pub type Labels = BTreeMap<String, String>;

/// Selectable fields extracted from an object by its resource kind.
pub type Fields = BTreeMap<String, String>;

static LABEL_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9.]*[a-z0-9])?/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").unwrap()
});
static LABEL_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?$").unwrap());

const MAX_LABEL_VALUE_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty requirement in {0:?}")]
    EmptyTerm(String),
    #[error("invalid label key {0:?}")]
    InvalidKey(String),
    #[error("invalid label value {0:?}")]
    InvalidValue(String),
    #[error("unbalanced parentheses in {0:?}")]
    Unbalanced(String),
    #[error("unknown operator in {0:?}")]
    UnknownOperator(String),
    #[error("field selector term {0:?} has no operator")]
    MissingOperator(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOp {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequirement {
    pub key: String,
    pub op: LabelOp,
    pub values: SmallVec<[String; 2]>,
}

impl LabelRequirement {
    fn matches(&self, labels: &Labels) -> bool {
        let got = labels.get(&self.key);
        match self.op {
            LabelOp::Equals => got.map(|v| self.values.iter().any(|x| x == v)).unwrap_or(false),
            LabelOp::NotEquals => got.map(|v| !self.values.iter().any(|x| x == v)).unwrap_or(true),
            LabelOp::In => got.map(|v| self.values.iter().any(|x| x == v)).unwrap_or(false),
            LabelOp::NotIn => got.map(|v| !self.values.iter().any(|x| x == v)).unwrap_or(true),
            LabelOp::Exists => got.is_some(),
            LabelOp::DoesNotExist => got.is_none(),
        }
    }
}

impl fmt::Display for LabelRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first = self.values.first().map(String::as_str).unwrap_or("");
        match self.op {
            LabelOp::Equals => write!(f, "{}={}", self.key, first),
            LabelOp::NotEquals => write!(f, "{}!={}", self.key, first),
            LabelOp::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            LabelOp::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            LabelOp::Exists => write!(f, "{}", self.key),
            LabelOp::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Conjunction of label requirements. Empty selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: SmallVec<[LabelRequirement; 4]>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let mut requirements = SmallVec::new();
        for term in split_top_level(s)? {
            requirements.push(parse_label_term(&term)?);
        }
        Ok(Self { requirements })
    }

    /// Selector requiring every `key=value` pair.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let requirements = pairs
            .into_iter()
            .map(|(k, v)| LabelRequirement {
                key: k.to_string(),
                op: LabelOp::Equals,
                values: SmallVec::from_iter([v.to_string()]),
            })
            .collect();
        Self { requirements }
    }

    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }
    pub fn requirements(&self) -> &[LabelRequirement] { &self.requirements }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOp {
    Equals,
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRequirement {
    pub field: String,
    pub op: FieldOp,
    pub value: String,
}

impl FieldRequirement {
    fn matches(&self, fields: &Fields) -> bool {
        match (self.op, fields.get(&self.field)) {
            (_, None) => false,
            (FieldOp::Equals, Some(v)) => *v == self.value,
            (FieldOp::NotEquals, Some(v)) => *v != self.value,
        }
    }
}

impl fmt::Display for FieldRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            FieldOp::Equals => write!(f, "{}={}", self.field, self.value),
            FieldOp::NotEquals => write!(f, "{}!={}", self.field, self.value),
        }
    }
}

/// Conjunction of field requirements. Empty selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    requirements: SmallVec<[FieldRequirement; 4]>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn one_term(field: &str, value: &str) -> Self {
        let mut requirements = SmallVec::new();
        requirements.push(FieldRequirement { field: field.to_string(), op: FieldOp::Equals, value: value.to_string() });
        Self { requirements }
    }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let mut requirements = SmallVec::new();
        for raw in s.split(',') {
            let term = raw.trim();
            if term.is_empty() {
                if s.trim().is_empty() {
                    continue;
                }
                return Err(SelectorError::EmptyTerm(s.to_string()));
            }
            let (field, op, value) = if let Some((k, v)) = term.split_once("!=") {
                (k, FieldOp::NotEquals, v)
            } else if let Some((k, v)) = term.split_once("==") {
                (k, FieldOp::Equals, v)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, FieldOp::Equals, v)
            } else {
                return Err(SelectorError::MissingOperator(term.to_string()));
            };
            let field = field.trim();
            if field.is_empty() {
                return Err(SelectorError::EmptyTerm(term.to_string()));
            }
            requirements.push(FieldRequirement { field: field.to_string(), op, value: value.trim().to_string() });
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }
    pub fn requirements(&self) -> &[FieldRequirement] { &self.requirements }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.requirements.iter().all(|r| r.matches(fields))
    }

    /// Value the selector pins `field` to with an equality requirement, if any.
    pub fn requires_exact(&self, field: &str) -> Option<&str> {
        self.requirements
            .iter()
            .find(|r| r.field == field && r.op == FieldOp::Equals)
            .map(|r| r.value.as_str())
    }
}

impl FromStr for FieldSelector {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

// Split on commas outside parentheses.
fn split_top_level(s: &str) -> Result<Vec<String>, SelectorError> {
    let mut out = Vec::new();
    if s.trim().is_empty() {
        return Ok(out);
    }
    let mut depth = 0i32;
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                cur.push(c);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SelectorError::Unbalanced(s.to_string()));
                }
                cur.push(c);
            }
            ',' if depth == 0 => out.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced(s.to_string()));
    }
    out.push(cur);
    Ok(out)
}

fn parse_label_term(raw: &str) -> Result<LabelRequirement, SelectorError> {
    let term = raw.trim();
    if term.is_empty() {
        return Err(SelectorError::EmptyTerm(raw.to_string()));
    }

    if let Some(open) = term.find('(') {
        let close = term
            .rfind(')')
            .filter(|c| *c == term.len() - 1)
            .ok_or_else(|| SelectorError::Unbalanced(term.to_string()))?;
        let head: Vec<&str> = term[..open].split_whitespace().collect();
        let (key, op) = match head.as_slice() {
            [key, "in"] => (*key, LabelOp::In),
            [key, "notin"] => (*key, LabelOp::NotIn),
            _ => return Err(SelectorError::UnknownOperator(term.to_string())),
        };
        let mut values = SmallVec::new();
        for v in term[open + 1..close].split(',') {
            let v = v.trim();
            check_value(v)?;
            values.push(v.to_string());
        }
        check_key(key)?;
        return Ok(LabelRequirement { key: key.to_string(), op, values });
    }

    let (key, op, value) = if let Some(key) = term.strip_prefix('!') {
        (key.trim(), LabelOp::DoesNotExist, None)
    } else if let Some((k, v)) = term.split_once("!=") {
        (k.trim(), LabelOp::NotEquals, Some(v.trim()))
    } else if let Some((k, v)) = term.split_once("==") {
        (k.trim(), LabelOp::Equals, Some(v.trim()))
    } else if let Some((k, v)) = term.split_once('=') {
        (k.trim(), LabelOp::Equals, Some(v.trim()))
    } else {
        (term, LabelOp::Exists, None)
    };
    check_key(key)?;
    let mut values = SmallVec::new();
    if let Some(v) = value {
        check_value(v)?;
        values.push(v.to_string());
    }
    Ok(LabelRequirement { key: key.to_string(), op, values })
}

fn check_key(key: &str) -> Result<(), SelectorError> {
    if LABEL_KEY_RE.is_match(key) { Ok(()) } else { Err(SelectorError::InvalidKey(key.to_string())) }
}

fn check_value(v: &str) -> Result<(), SelectorError> {
    if v.len() <= MAX_LABEL_VALUE_LEN && LABEL_VALUE_RE.is_match(v) {
        Ok(())
    } else {
        Err(SelectorError::InvalidValue(v.to_string()))
    }
}
