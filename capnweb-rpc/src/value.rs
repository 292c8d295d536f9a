//! The dynamic value domain of the protocol.
//!
//! Values are JSON-shaped data enriched with the things that may cross the
//! RPC boundary alongside it: timestamps, errors, and live capability
//! references. Cloning a value never copies a capability; embedded stubs and
//! promises share their hook through `add_ref`.

use std::collections::BTreeMap;

use capnweb::RpcError;
use serde_json::Number;

use crate::capability::{RpcPromise, RpcStub};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Error(RpcError),
    Stub(RpcStub),
    Promise(RpcPromise),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(Number::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(Number::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        match Number::from_f64(n) {
            Some(num) => Self::Number(num),
            None => Self::Null,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<RpcError> for Value {
    fn from(e: RpcError) -> Self {
        Self::Error(e)
    }
}

impl From<RpcStub> for Value {
    fn from(s: RpcStub) -> Self {
        Self::Stub(s)
    }
}

impl From<RpcPromise> for Value {
    fn from(p: RpcPromise) -> Self {
        Self::Promise(p)
    }
}
