#![forbid(unsafe_code)]

//! Value model shared by both sides of a binding.
//!
//! A host value is either a [`ScalarValue`] (mirrored by copy) or a reference
//! to one of the three host capabilities (mirrored by identity): an observable
//! object, an observable list, or a command. Values the host cannot express in
//! those terms are carried as [`HostValue::Opaque`] and degrade to a null
//! mirror with a diagnostic, never an error.
//!
//! # Invariants
//!
//! - [`ScalarValue`] equality and hashing are bit-exact for floats, so a NaN
//!   written to one side compares equal to the same NaN coming back. Echo
//!   detection relies on this.
//! - [`HostId`] is stable for the lifetime of the underlying allocation: two
//!   clones of the same capability handle map to the same id.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::host::{CommandRef, HostCommand, ListRef, ObjectRef, ObservableList, ObservableObject};

/// Plain data mirrored by value.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarValue {
    /// True for [`ScalarValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

// Bit-exact float comparison: NaN == NaN, and -0.0 != 0.0. A value that
// round-trips through the mirror must compare equal to itself.
impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => state.write_u8(0),
            Self::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Self::Int(i) => {
                state.write_u8(2);
                i.hash(state);
            }
            Self::Float(x) => {
                state.write_u8(3);
                x.to_bits().hash(state);
            }
            Self::Str(s) => {
                state.write_u8(4);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// The mirror shape a value maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueKind {
    Scalar,
    Object,
    Array,
    Command,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scalar => "scalar",
            Self::Object => "object",
            Self::Array => "array",
            Self::Command => "command",
        };
        f.write_str(name)
    }
}

/// A value as exposed by the host graph.
#[derive(Clone)]
pub enum HostValue {
    Scalar(ScalarValue),
    Object(ObjectRef),
    List(ListRef),
    Command(CommandRef),
    /// A host-side type with no mirror representation. Carries the host's
    /// name for the type, mirrors as null.
    Opaque(String),
}

impl HostValue {
    /// Shorthand for a null scalar.
    #[must_use]
    pub fn null() -> Self {
        Self::Scalar(ScalarValue::Null)
    }

    /// The mirror shape this value maps to. Opaque values degrade to
    /// [`ValueKind::Scalar`] (they mirror as null).
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Scalar(_) | Self::Opaque(_) => ValueKind::Scalar,
            Self::Object(_) => ValueKind::Object,
            Self::List(_) => ValueKind::Array,
            Self::Command(_) => ValueKind::Command,
        }
    }

    /// Identity of the referenced capability, if this is a reference value.
    #[must_use]
    pub fn identity(&self) -> Option<HostId> {
        match self {
            Self::Scalar(_) | Self::Opaque(_) => None,
            Self::Object(o) => Some(HostId::of_object(o)),
            Self::List(l) => Some(HostId::of_list(l)),
            Self::Command(c) => Some(HostId::of_command(c)),
        }
    }

    /// Wrap an observable object.
    #[must_use]
    pub fn object(o: Arc<dyn ObservableObject>) -> Self {
        Self::Object(o)
    }

    /// Wrap an observable list.
    #[must_use]
    pub fn list(l: Arc<dyn ObservableList>) -> Self {
        Self::List(l)
    }

    /// Wrap a command.
    #[must_use]
    pub fn command(c: Arc<dyn HostCommand>) -> Self {
        Self::Command(c)
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "Scalar({s})"),
            Self::Object(o) => write!(f, "Object({:?})", HostId::of_object(o)),
            Self::List(l) => write!(f, "List({:?})", HostId::of_list(l)),
            Self::Command(c) => write!(f, "Command({:?})", HostId::of_command(c)),
            Self::Opaque(ty) => write!(f, "Opaque({ty})"),
        }
    }
}

impl From<ScalarValue> for HostValue {
    fn from(v: ScalarValue) -> Self {
        Self::Scalar(v)
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Scalar(ScalarValue::Bool(v))
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        Self::Scalar(ScalarValue::Int(i64::from(v)))
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        Self::Scalar(ScalarValue::Int(v))
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        Self::Scalar(ScalarValue::Float(v))
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        Self::Scalar(ScalarValue::Str(v.to_owned()))
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        Self::Scalar(ScalarValue::Str(v))
    }
}

/// Identity of a host capability, derived from its allocation address.
///
/// Stable across clones of the same handle; never reused while any clone is
/// alive. The binding engine keys its listener table with this.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(usize);

impl HostId {
    #[must_use]
    pub fn of_object(r: &ObjectRef) -> Self {
        Self(Arc::as_ptr(r) as *const () as usize)
    }

    #[must_use]
    pub fn of_list(r: &ListRef) -> Self {
        Self(Arc::as_ptr(r) as *const () as usize)
    }

    #[must_use]
    pub fn of_command(r: &CommandRef) -> Self {
        Self(Arc::as_ptr(r) as *const () as usize)
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({:#x})", self.0)
    }
}
