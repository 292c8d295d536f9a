//! The textual wire format: JSON expressions, the six message kinds, and
//! newline-delimited batch framing.
//!
//! Expressions are ordinary JSON values except that an array whose first
//! element is one of the reserved tag strings is a tagged form. A plain array
//! that happens to start with a reserved tag is escaped by wrapping it in a
//! single-element outer array; decoders unwrap exactly once.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Number, Value as JsonValue};

use crate::error::{ErrorKind, RpcError};
use crate::ids::{ExportId, ImportId};

const RESERVED_TAGS: &[&str] = &[
    "error", "import", "export", "promise", "pipeline", "date", "remap",
];

fn is_reserved_tag(s: &str) -> bool {
    RESERVED_TAGS.contains(&s)
}

/// A property key: a string name or an integer index into a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(String),
    Index(u64),
}

impl PropertyKey {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Index(i) => JsonValue::Number(Number::from(*i)),
        }
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, RpcError> {
        match value {
            JsonValue::String(s) => Ok(Self::String(s.clone())),
            JsonValue::Number(n) => n
                .as_u64()
                .map(Self::Index)
                .ok_or_else(|| RpcError::bad_request(format!("invalid property key: {n}"))),
            other => Err(RpcError::bad_request(format!(
                "invalid property key: {other}"
            ))),
        }
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for PropertyKey {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<u64> for PropertyKey {
    fn from(i: u64) -> Self {
        Self::Index(i)
    }
}

/// Error expression: `["error", type, message, stack?, data?]`.
///
/// The kind is kept as its raw wire string so that unknown kinds survive a
/// decode/encode cycle unchanged; [`WireError::to_error`] is where unknown
/// kinds collapse to `internal`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireError {
    pub error_type: String,
    pub message: String,
    pub stack: Option<String>,
    pub data: Option<JsonValue>,
}

impl WireError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack: None,
            data: None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut arr = vec![
            JsonValue::String("error".into()),
            JsonValue::String(self.error_type.clone()),
            JsonValue::String(self.message.clone()),
        ];
        if let Some(stack) = &self.stack {
            arr.push(JsonValue::String(stack.clone()));
            if let Some(data) = &self.data {
                arr.push(data.clone());
            }
        } else if let Some(data) = &self.data {
            // No stack but data present: hold the stack slot open with null.
            arr.push(JsonValue::Null);
            arr.push(data.clone());
        }
        JsonValue::Array(arr)
    }

    pub fn from_json(arr: &[JsonValue]) -> Result<Self, RpcError> {
        if arr.len() < 3 {
            return Err(RpcError::bad_request(
                "error expression requires at least 3 elements",
            ));
        }
        let error_type = arr[1]
            .as_str()
            .ok_or_else(|| RpcError::bad_request("error type must be a string"))?
            .to_owned();
        let message = arr[2]
            .as_str()
            .ok_or_else(|| RpcError::bad_request("error message must be a string"))?
            .to_owned();
        let stack = arr.get(3).and_then(|v| v.as_str()).map(str::to_owned);
        let data = arr.get(4).filter(|v| v.is_object()).cloned();
        Ok(Self {
            error_type,
            message,
            stack,
            data,
        })
    }

    /// Materializes the wire error as a local [`RpcError`], collapsing
    /// unknown kinds to `internal`.
    pub fn to_error(&self) -> RpcError {
        let mut err = RpcError::new(ErrorKind::from_wire(&self.error_type), self.message.clone());
        err.data = self.data.clone();
        err
    }
}

impl From<&RpcError> for WireError {
    fn from(err: &RpcError) -> Self {
        Self {
            error_type: err.kind.as_str().to_owned(),
            message: err.message.clone(),
            stack: None,
            data: err.data.clone(),
        }
    }
}

/// Pipeline expression: `["pipeline", target, path | null, args?]`.
///
/// With `args` absent this is a property get; with `args` present the last
/// path element names the method to call.
#[derive(Debug, Clone, PartialEq)]
pub struct WirePipeline {
    pub target: i64,
    pub path: Option<Vec<PropertyKey>>,
    pub args: Option<Box<Expression>>,
}

impl WirePipeline {
    pub fn to_json(&self) -> JsonValue {
        let path = match &self.path {
            Some(keys) => JsonValue::Array(keys.iter().map(PropertyKey::to_json).collect()),
            None => JsonValue::Null,
        };
        let mut arr = vec![
            JsonValue::String("pipeline".into()),
            JsonValue::Number(Number::from(self.target)),
            path,
        ];
        if let Some(args) = &self.args {
            arr.push(args.to_json());
        }
        JsonValue::Array(arr)
    }

    pub fn from_json(arr: &[JsonValue]) -> Result<Self, RpcError> {
        if arr.len() < 2 {
            return Err(RpcError::bad_request(
                "pipeline expression requires at least 2 elements",
            ));
        }
        let target = arr[1]
            .as_i64()
            .ok_or_else(|| RpcError::bad_request("pipeline target must be an integer"))?;
        let path = match arr.get(2) {
            Some(JsonValue::Array(keys)) if !keys.is_empty() => Some(
                keys.iter()
                    .map(PropertyKey::from_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => None,
        };
        let args = match arr.get(3) {
            Some(JsonValue::Null) | None => None,
            Some(v) => Some(Box::new(Expression::from_json(v)?)),
        };
        Ok(Self { target, path, args })
    }
}

/// A capture slot inside a `remap` expression.
///
/// `["import", id]` refers to a capability the sender already imports from
/// us; `["export", id]` is a fresh capability the sender is exporting to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRef {
    Import(i64),
    Export(i64),
}

impl CaptureRef {
    pub fn to_json(&self) -> JsonValue {
        let (tag, id) = match self {
            Self::Import(id) => ("import", *id),
            Self::Export(id) => ("export", *id),
        };
        JsonValue::Array(vec![
            JsonValue::String(tag.into()),
            JsonValue::Number(Number::from(id)),
        ])
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, RpcError> {
        let arr = value
            .as_array()
            .ok_or_else(|| RpcError::bad_request("capture must be an array"))?;
        if arr.len() != 2 {
            return Err(RpcError::bad_request(
                "capture requires ['import'|'export', id]",
            ));
        }
        let id = arr[1]
            .as_i64()
            .ok_or_else(|| RpcError::bad_request("capture id must be an integer"))?;
        match arr[0].as_str() {
            Some("import") => Ok(Self::Import(id)),
            Some("export") => Ok(Self::Export(id)),
            _ => Err(RpcError::bad_request(
                "capture requires ['import'|'export', id]",
            )),
        }
    }
}

/// Remap expression: `["remap", target, path | null, captures, instructions]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRemap {
    pub target: i64,
    pub path: Option<Vec<PropertyKey>>,
    pub captures: Vec<CaptureRef>,
    pub instructions: Vec<Expression>,
}

impl WireRemap {
    pub fn to_json(&self) -> JsonValue {
        let path = match &self.path {
            Some(keys) => JsonValue::Array(keys.iter().map(PropertyKey::to_json).collect()),
            None => JsonValue::Null,
        };
        JsonValue::Array(vec![
            JsonValue::String("remap".into()),
            JsonValue::Number(Number::from(self.target)),
            path,
            JsonValue::Array(self.captures.iter().map(CaptureRef::to_json).collect()),
            JsonValue::Array(self.instructions.iter().map(Expression::to_json).collect()),
        ])
    }

    pub fn from_json(arr: &[JsonValue]) -> Result<Self, RpcError> {
        if arr.len() != 5 {
            return Err(RpcError::bad_request(
                "remap expression requires exactly 5 elements",
            ));
        }
        let target = arr[1]
            .as_i64()
            .ok_or_else(|| RpcError::bad_request("remap target must be an integer"))?;
        let path = match &arr[2] {
            JsonValue::Array(keys) if !keys.is_empty() => Some(
                keys.iter()
                    .map(PropertyKey::from_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => None,
        };
        let captures = arr[3]
            .as_array()
            .ok_or_else(|| RpcError::bad_request("remap captures must be an array"))?
            .iter()
            .map(CaptureRef::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        let instructions = arr[4]
            .as_array()
            .ok_or_else(|| RpcError::bad_request("remap instructions must be an array"))?
            .iter()
            .map(Expression::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            target,
            path,
            captures,
            instructions,
        })
    }
}

/// A wire expression: plain JSON data plus the tagged forms.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Expression>),
    Object(BTreeMap<String, Expression>),
    Error(WireError),
    Import(i64),
    Export(i64),
    Promise(i64),
    Date(f64),
    Pipeline(WirePipeline),
    Remap(WireRemap),
}

impl Expression {
    pub fn from_json(value: &JsonValue) -> Result<Self, RpcError> {
        match value {
            JsonValue::Null => Ok(Self::Null),
            JsonValue::Bool(b) => Ok(Self::Bool(*b)),
            JsonValue::Number(n) => Ok(Self::Number(n.clone())),
            JsonValue::String(s) => Ok(Self::String(s.clone())),
            JsonValue::Object(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), Self::from_json(v)?);
                }
                Ok(Self::Object(out))
            }
            JsonValue::Array(arr) => Self::from_json_array(arr),
        }
    }

    fn from_json_array(arr: &[JsonValue]) -> Result<Self, RpcError> {
        if arr.is_empty() {
            return Ok(Self::Array(Vec::new()));
        }

        // Escaped literal: a single-element array wrapping an array whose
        // first element is a reserved tag decodes to the plain inner array.
        if arr.len() == 1 {
            if let JsonValue::Array(inner) = &arr[0] {
                if let Some(JsonValue::String(tag)) = inner.first() {
                    if is_reserved_tag(tag) {
                        let items = inner
                            .iter()
                            .map(Self::from_json)
                            .collect::<Result<Vec<_>, _>>()?;
                        return Ok(Self::Array(items));
                    }
                }
            }
        }

        if let JsonValue::String(tag) = &arr[0] {
            match tag.as_str() {
                "error" => return WireError::from_json(arr).map(Self::Error),
                "import" => return Self::tagged_id(arr, "import").map(Self::Import),
                "export" => return Self::tagged_id(arr, "export").map(Self::Export),
                "promise" => return Self::tagged_id(arr, "promise").map(Self::Promise),
                "pipeline" => return WirePipeline::from_json(arr).map(Self::Pipeline),
                "remap" => return WireRemap::from_json(arr).map(Self::Remap),
                "date" => {
                    if arr.len() != 2 {
                        return Err(RpcError::bad_request(
                            "date expression requires exactly 2 elements",
                        ));
                    }
                    let ms = arr[1]
                        .as_f64()
                        .ok_or_else(|| RpcError::bad_request("date timestamp must be a number"))?;
                    return Ok(Self::Date(ms));
                }
                _ => {}
            }
        }

        let items = arr
            .iter()
            .map(Self::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::Array(items))
    }

    fn tagged_id(arr: &[JsonValue], tag: &str) -> Result<i64, RpcError> {
        if arr.len() != 2 {
            return Err(RpcError::bad_request(format!(
                "{tag} expression requires exactly 2 elements"
            )));
        }
        arr[1]
            .as_i64()
            .ok_or_else(|| RpcError::bad_request(format!("{tag} id must be an integer")))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Number(n) => JsonValue::Number(n.clone()),
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Array(items) => {
                let ser: Vec<JsonValue> = items.iter().map(Self::to_json).collect();
                // Escape a plain array that would otherwise read as a tagged
                // form.
                let needs_escape = matches!(
                    ser.first(),
                    Some(JsonValue::String(s)) if is_reserved_tag(s)
                );
                if needs_escape {
                    JsonValue::Array(vec![JsonValue::Array(ser)])
                } else {
                    JsonValue::Array(ser)
                }
            }
            Self::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                JsonValue::Object(out)
            }
            Self::Error(e) => e.to_json(),
            Self::Import(id) => JsonValue::Array(vec![
                JsonValue::String("import".into()),
                JsonValue::Number(Number::from(*id)),
            ]),
            Self::Export(id) => JsonValue::Array(vec![
                JsonValue::String("export".into()),
                JsonValue::Number(Number::from(*id)),
            ]),
            Self::Promise(id) => JsonValue::Array(vec![
                JsonValue::String("promise".into()),
                JsonValue::Number(Number::from(*id)),
            ]),
            Self::Date(ms) => {
                let n = Number::from_f64(*ms).unwrap_or_else(|| Number::from(0));
                JsonValue::Array(vec![JsonValue::String("date".into()), JsonValue::Number(n)])
            }
            Self::Pipeline(p) => p.to_json(),
            Self::Remap(r) => r.to_json(),
        }
    }

    /// Convenience constructor for an integer literal.
    pub fn integer(n: i64) -> Self {
        Self::Number(Number::from(n))
    }
}

/// One of the six session messages.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Introduce a new outstanding expression. Within a batch, the n-th push
    /// implicitly takes ID n.
    Push(Expression),
    /// Ask the peer to eventually resolve or reject the named import.
    Pull(ImportId),
    /// Settle an export positively.
    Resolve(ExportId, Expression),
    /// Settle an export negatively with an error expression.
    Reject(ExportId, Expression),
    /// Retire an import. The count is the number of times the peer
    /// introduced the ID since it was last released.
    Release(ImportId, u32),
    /// Fatal session error.
    Abort(Expression),
}

impl Message {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Push(expr) => JsonValue::Array(vec![
                JsonValue::String("push".into()),
                expr.to_json(),
            ]),
            Self::Pull(id) => JsonValue::Array(vec![
                JsonValue::String("pull".into()),
                JsonValue::Number(Number::from(id.0)),
            ]),
            Self::Resolve(id, value) => JsonValue::Array(vec![
                JsonValue::String("resolve".into()),
                JsonValue::Number(Number::from(id.0)),
                value.to_json(),
            ]),
            Self::Reject(id, error) => JsonValue::Array(vec![
                JsonValue::String("reject".into()),
                JsonValue::Number(Number::from(id.0)),
                error.to_json(),
            ]),
            Self::Release(id, count) => JsonValue::Array(vec![
                JsonValue::String("release".into()),
                JsonValue::Number(Number::from(id.0)),
                JsonValue::Number(Number::from(*count)),
            ]),
            Self::Abort(error) => JsonValue::Array(vec![
                JsonValue::String("abort".into()),
                error.to_json(),
            ]),
        }
    }

    pub fn from_json(value: &JsonValue) -> Result<Self, RpcError> {
        let arr = value
            .as_array()
            .ok_or_else(|| RpcError::bad_request("wire message must be a non-empty array"))?;
        let tag = arr
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::bad_request("message type must be a string"))?;
        match tag {
            "push" => {
                Self::expect_len(arr, 2, "push")?;
                Ok(Self::Push(Expression::from_json(&arr[1])?))
            }
            "pull" => {
                Self::expect_len(arr, 2, "pull")?;
                Ok(Self::Pull(ImportId(Self::id_at(arr, 1)?)))
            }
            "resolve" => {
                Self::expect_len(arr, 3, "resolve")?;
                Ok(Self::Resolve(
                    ExportId(Self::id_at(arr, 1)?),
                    Expression::from_json(&arr[2])?,
                ))
            }
            "reject" => {
                Self::expect_len(arr, 3, "reject")?;
                Ok(Self::Reject(
                    ExportId(Self::id_at(arr, 1)?),
                    Expression::from_json(&arr[2])?,
                ))
            }
            "release" => {
                Self::expect_len(arr, 3, "release")?;
                let count = arr[2]
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| RpcError::bad_request("release count must be a u32"))?;
                Ok(Self::Release(ImportId(Self::id_at(arr, 1)?), count))
            }
            "abort" => {
                Self::expect_len(arr, 2, "abort")?;
                Ok(Self::Abort(Expression::from_json(&arr[1])?))
            }
            other => Err(RpcError::bad_request(format!(
                "unknown message type: {other}"
            ))),
        }
    }

    fn expect_len(arr: &[JsonValue], len: usize, tag: &str) -> Result<(), RpcError> {
        if arr.len() != len {
            return Err(RpcError::bad_request(format!(
                "{tag} message requires exactly {len} elements"
            )));
        }
        Ok(())
    }

    fn id_at(arr: &[JsonValue], index: usize) -> Result<i64, RpcError> {
        arr[index]
            .as_i64()
            .ok_or_else(|| RpcError::bad_request("message id must be an integer"))
    }
}

/// Parses a single wire message from one line of a batch.
pub fn parse_message(line: &str) -> Result<Message, RpcError> {
    let value: JsonValue = serde_json::from_str(line)
        .map_err(|e| RpcError::bad_request(format!("invalid message JSON: {e}")))?;
    Message::from_json(&value)
}

/// Serializes a single wire message to its line representation.
pub fn serialize_message(msg: &Message) -> String {
    msg.to_json().to_string()
}

/// Parses a newline-delimited batch. Blank lines are ignored; an empty body
/// is a valid empty batch.
pub fn parse_batch(data: &str) -> Result<Vec<Message>, RpcError> {
    data.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_message)
        .collect()
}

/// Serializes a batch, one message per line, each line terminated by `\n`.
pub fn serialize_batch(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&serialize_message(msg));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, Arbitrary, Gen};

    fn roundtrip_expr(expr: &Expression) -> Expression {
        Expression::from_json(&expr.to_json()).expect("decode failed")
    }

    fn roundtrip_msg(msg: &Message) -> Message {
        parse_message(&serialize_message(msg)).expect("decode failed")
    }

    #[test]
    fn primitive_expressions_round_trip() {
        for expr in [
            Expression::Null,
            Expression::Bool(true),
            Expression::integer(-42),
            Expression::String("hello".into()),
            Expression::Date(1700000000000.0),
        ] {
            assert_eq!(roundtrip_expr(&expr), expr);
        }
    }

    #[test]
    fn tagged_forms_round_trip() {
        let exprs = [
            Expression::Import(3),
            Expression::Export(-7),
            Expression::Promise(12),
            Expression::Error(WireError {
                error_type: "not_found".into(),
                message: "Method foo not found".into(),
                stack: None,
                data: None,
            }),
            Expression::Pipeline(WirePipeline {
                target: 0,
                path: Some(vec!["add".into()]),
                args: Some(Box::new(Expression::Array(vec![
                    Expression::integer(5),
                    Expression::integer(3),
                ]))),
            }),
            Expression::Pipeline(WirePipeline {
                target: 1,
                path: Some(vec!["user".into(), "id".into()]),
                args: None,
            }),
            Expression::Remap(WireRemap {
                target: 1,
                path: None,
                captures: vec![CaptureRef::Import(2), CaptureRef::Export(4)],
                instructions: vec![
                    Expression::Pipeline(WirePipeline {
                        target: 0,
                        path: Some(vec!["id".into()]),
                        args: None,
                    }),
                    Expression::integer(1),
                ],
            }),
        ];
        for expr in exprs {
            assert_eq!(roundtrip_expr(&expr), expr);
        }
    }

    #[test]
    fn error_slot_rules() {
        // data without a stack keeps the stack slot open with null
        let e = WireError {
            error_type: "bad_request".into(),
            message: "nope".into(),
            stack: None,
            data: Some(serde_json::json!({"field": "x"})),
        };
        assert_eq!(
            e.to_json(),
            serde_json::json!(["error", "bad_request", "nope", null, {"field": "x"}])
        );
        assert_eq!(roundtrip_expr(&Expression::Error(e.clone())), Expression::Error(e));

        let with_stack = WireError {
            error_type: "internal".into(),
            message: "boom".into(),
            stack: Some("at line 1".into()),
            data: None,
        };
        assert_eq!(
            with_stack.to_json(),
            serde_json::json!(["error", "internal", "boom", "at line 1"])
        );
    }

    #[test]
    fn unknown_error_kind_is_preserved_on_the_wire() {
        let e = Expression::Error(WireError::new("weird_kind", "huh"));
        assert_eq!(roundtrip_expr(&e), e);
        if let Expression::Error(we) = e {
            assert_eq!(we.to_error().kind, ErrorKind::Internal);
        }
    }

    #[test]
    fn plain_array_starting_with_tag_is_escaped() {
        let literal = Expression::Array(vec![
            Expression::String("error".into()),
            Expression::String("not actually".into()),
        ]);
        let encoded = literal.to_json();
        assert_eq!(
            encoded,
            serde_json::json!([["error", "not actually"]]),
        );
        assert_eq!(roundtrip_expr(&literal), literal);
    }

    #[test]
    fn array_starting_with_unreserved_string_is_not_escaped() {
        let literal = Expression::Array(vec![
            Expression::String("hello".into()),
            Expression::String("world".into()),
        ]);
        assert_eq!(literal.to_json(), serde_json::json!(["hello", "world"]));
        assert_eq!(roundtrip_expr(&literal), literal);
    }

    #[test]
    fn single_element_wrapper_of_tagged_array_round_trips() {
        // A genuine value that is a one-element array containing an
        // array-starting-with-tag: inner escape keeps it unambiguous.
        let literal = Expression::Array(vec![Expression::Array(vec![
            Expression::String("error".into()),
            Expression::integer(1),
        ])]);
        assert_eq!(roundtrip_expr(&literal), literal);
    }

    #[test]
    fn message_grid_round_trips() {
        let msgs = [
            Message::Push(Expression::Pipeline(WirePipeline {
                target: 0,
                path: Some(vec!["add".into()]),
                args: Some(Box::new(Expression::Array(vec![
                    Expression::integer(5),
                    Expression::integer(3),
                ]))),
            })),
            Message::Pull(ImportId(1)),
            Message::Resolve(ExportId(1), Expression::integer(8)),
            Message::Reject(
                ExportId(1),
                Expression::Error(WireError::new("not_found", "Method foo not found")),
            ),
            Message::Release(ImportId(7), 3),
            Message::Abort(Expression::Error(WireError::new("internal", "fatal"))),
        ];
        for msg in msgs {
            assert_eq!(roundtrip_msg(&msg), msg);
        }
    }

    #[test]
    fn push_pull_wire_shape_matches_protocol() {
        let batch = serialize_batch(&[
            Message::Push(Expression::Pipeline(WirePipeline {
                target: 0,
                path: Some(vec!["add".into()]),
                args: Some(Box::new(Expression::Array(vec![
                    Expression::integer(5),
                    Expression::integer(3),
                ]))),
            })),
            Message::Pull(ImportId(1)),
        ]);
        assert_eq!(
            batch,
            "[\"push\",[\"pipeline\",0,[\"add\"],[5,3]]]\n[\"pull\",1]\n"
        );
    }

    #[test]
    fn empty_batch_is_valid() {
        assert_eq!(parse_batch("").unwrap(), vec![]);
        assert_eq!(serialize_batch(&[]), "");
    }

    #[test]
    fn blank_lines_are_skipped() {
        let parsed = parse_batch("[\"pull\",1]\n\n[\"pull\",2]\n").unwrap();
        assert_eq!(parsed, vec![Message::Pull(ImportId(1)), Message::Pull(ImportId(2))]);
    }

    #[test]
    fn unknown_message_tag_is_rejected() {
        let err = parse_message("[\"frobnicate\",1]").unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn non_array_message_is_rejected() {
        assert!(parse_message("{\"push\": 1}").is_err());
        assert!(parse_message("not json").is_err());
    }

    #[test]
    fn pipeline_null_args_means_property_get() {
        let msg = parse_message("[\"push\",[\"pipeline\",1,[\"id\"],null]]").unwrap();
        match msg {
            Message::Push(Expression::Pipeline(p)) => {
                assert_eq!(p.target, 1);
                assert!(p.args.is_none());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[derive(Debug, Clone)]
    struct ArbExpression(Expression);

    fn arbitrary_expression(g: &mut Gen, depth: usize) -> Expression {
        let max = if depth == 0 { 5 } else { 9 };
        match u8::arbitrary(g) % max {
            0 => Expression::Null,
            1 => Expression::Bool(bool::arbitrary(g)),
            2 => Expression::integer(i64::arbitrary(g)),
            3 => Expression::String(String::arbitrary(g)),
            4 => Expression::Date(f64::from(i32::arbitrary(g))),
            5 => {
                let len = usize::arbitrary(g) % 4;
                if len == 1 {
                    // A one-element array wrapping a tagged form is the
                    // escape sequence itself; keep such elements plain.
                    Expression::Array(vec![arbitrary_plain(g)])
                } else {
                    Expression::Array(
                        (0..len)
                            .map(|_| arbitrary_expression(g, depth - 1))
                            .collect(),
                    )
                }
            }
            6 => {
                let len = usize::arbitrary(g) % 4;
                let mut map = BTreeMap::new();
                for i in 0..len {
                    map.insert(format!("k{i}"), arbitrary_expression(g, depth - 1));
                }
                Expression::Object(map)
            }
            7 => Expression::Import(i64::arbitrary(g)),
            8 => {
                let error_type = g
                    .choose(&["bad_request", "not_found", "internal", "custom_kind"])
                    .unwrap()
                    .to_string();
                Expression::Error(WireError {
                    error_type,
                    message: String::arbitrary(g),
                    stack: Option::<String>::arbitrary(g),
                    data: if bool::arbitrary(g) {
                        Some(serde_json::json!({"detail": u32::arbitrary(g)}))
                    } else {
                        None
                    },
                })
            }
            _ => unreachable!(),
        }
    }

    fn arbitrary_plain(g: &mut Gen) -> Expression {
        match u8::arbitrary(g) % 4 {
            0 => Expression::Null,
            1 => Expression::Bool(bool::arbitrary(g)),
            2 => Expression::integer(i64::arbitrary(g)),
            3 => Expression::String(String::arbitrary(g)),
            _ => unreachable!(),
        }
    }

    impl Arbitrary for ArbExpression {
        fn arbitrary(g: &mut Gen) -> Self {
            Self(arbitrary_expression(g, 3))
        }
    }

    quickcheck! {
        fn expression_roundtrip(expr: ArbExpression) -> bool {
            roundtrip_expr(&expr.0) == expr.0
        }

        fn resolve_roundtrip(id: i64, expr: ArbExpression) -> bool {
            let msg = Message::Resolve(ExportId(id), expr.0);
            roundtrip_msg(&msg) == msg
        }
    }
}
