// https://redis.io/docs/reference/protocol-spec

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use itertools::Itertools;
use strum_macros::{AsRefStr, Display};

/// One decoded RESP2 reply.
///
/// The accessors never fail: asking a reply for a shape it does not have returns a neutral value
/// (an empty string, `-1`, or no children). Callers are expected to check [`Reply::kind`] first.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Nil,
    Error(String),
    Status(String),
    // Kept as text, the server is trusted to send digits but the caller decides what a bad
    // integer means.
    Integer(String),
    Bulk(Bytes),
    Array(Vec<Reply>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Nil,
    Error,
    Status,
    Integer,
    Bulk,
    Array,
}

impl Reply {
    pub fn kind(&self) -> Kind {
        match self {
            Reply::Nil => Kind::Nil,
            Reply::Error(_) => Kind::Error,
            Reply::Status(_) => Kind::Status,
            Reply::Integer(_) => Kind::Integer,
            Reply::Bulk(_) => Kind::Bulk,
            Reply::Array(_) => Kind::Array,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// The integer value, or `None` when this is not an integer reply or its text does not parse.
    pub fn try_integer(&self) -> Option<i64> {
        match self {
            // RESP allows an explicit plus sign, `str::parse` accepts it as well.
            Reply::Integer(text) => text.parse().ok(),
            _ => None,
        }
    }

    /// The integer value, `-1` for any other kind of reply.
    pub fn integer(&self) -> i64 {
        self.try_integer().unwrap_or(-1)
    }

    pub fn status(&self) -> &str {
        match self {
            Reply::Status(s) => s.as_str(),
            _ => "",
        }
    }

    pub fn error(&self) -> &str {
        match self {
            Reply::Error(s) => s.as_str(),
            _ => "",
        }
    }

    /// The bulk payload decoded as UTF-8. Invalid sequences are replaced, use [`Reply::bytes`] to
    /// get the payload untouched.
    pub fn string(&self) -> Cow<'_, str> {
        match self {
            Reply::Bulk(bytes) => String::from_utf8_lossy(bytes),
            _ => Cow::Borrowed(""),
        }
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn children(&self) -> &[Reply] {
        match self {
            Reply::Array(children) => children,
            _ => &[],
        }
    }

    /// The text payload whatever the scalar kind is. A nil reply reads as `nil` and an array has
    /// no scalar text.
    pub fn scalar(&self) -> Cow<'_, str> {
        match self {
            Reply::Nil => Cow::Borrowed("nil"),
            Reply::Error(s) | Reply::Status(s) | Reply::Integer(s) => Cow::Borrowed(s.as_str()),
            Reply::Bulk(bytes) => String::from_utf8_lossy(bytes),
            Reply::Array(_) => Cow::Borrowed(""),
        }
    }

    /// Flattens an array reply into its bulk string fields, in order. Anything that is not an
    /// array yields no rows.
    pub fn rows(&self) -> Vec<String> {
        self.children()
            .iter()
            .map(|child| child.string().into_owned())
            .collect()
    }
}

/// Free-standing form of [`Reply::rows`] for callers mapping over replies.
pub fn decode_rows(reply: &Reply) -> Vec<String> {
    reply.rows()
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => write!(f, "(nil)"),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Integer(s) => write!(f, "(integer) {}", s),
            Reply::Bulk(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
            Reply::Array(children) => write!(f, "[{}]", children.iter().join(", ")),
        }
    }
}
