//! Core type definitions for the GDS store
//!
//! This module defines the addressing types (namespaces, ranks, process
//! identifiers, scopes) and the tagged [`Value`] union together with the
//! [`Info`] and [`KeyValue`] records that every layer above stores and
//! exchanges.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rank of a process within a namespace
///
/// The top of the `u32` range is reserved for marker ranks that address
/// more than one process (or none in particular).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct Rank(u32);

impl Rank {
    /// Rank is not known to the caller
    pub const UNDEF: Self = Self(u32::MAX);
    /// Addresses the job as a whole
    pub const WILDCARD: Self = Self(u32::MAX - 1);
    /// Addresses every process on the local node
    pub const LOCAL_NODE: Self = Self(u32::MAX - 2);
    /// Ranks at or above this value are markers, not processes
    pub const VALID_LIMIT: u32 = u32::MAX - 50;

    /// Create a rank from its numeric value
    #[must_use]
    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    /// Get the numeric value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check whether this rank names an actual process
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 < Self::VALID_LIMIT
    }

    #[must_use]
    pub const fn is_wildcard(self) -> bool {
        self.0 == Self::WILDCARD.0
    }

    #[must_use]
    pub const fn is_undef(self) -> bool {
        self.0 == Self::UNDEF.0
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNDEF => write!(f, "UNDEF"),
            Self::WILDCARD => write!(f, "WILDCARD"),
            Self::LOCAL_NODE => write!(f, "LOCAL_NODE"),
            Self(r) => write!(f, "{r}"),
        }
    }
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rank({self})")
    }
}

/// Namespace identifier of one distributed job
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct Nspace(String);

impl Nspace {
    /// Create a namespace identifier
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the namespace as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Nspace {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Debug for Nspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nspace({})", self.0)
    }
}

/// Fully qualified process identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcId {
    pub nspace: Nspace,
    pub rank: Rank,
}

impl ProcId {
    #[must_use]
    pub fn new(nspace: impl Into<Nspace>, rank: Rank) -> Self {
        Self {
            nspace: nspace.into(),
            rank,
        }
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.nspace, self.rank)
    }
}

/// Visibility class of a stored value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Caller did not say; fetches search every table
    #[default]
    Undef,
    /// Visible to processes on the same node
    Local,
    /// Visible to processes on other nodes
    Remote,
    /// Visible everywhere (stored as both local and remote)
    Global,
    /// Never leaves this process
    Internal,
}

impl Scope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undef => "UNDEF",
            Self::Local => "LOCAL",
            Self::Remote => "REMOTE",
            Self::Global => "GLOBAL",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Library version reported by a peer during connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerVersion {
    pub major: u8,
    pub minor: u8,
    pub release: u8,
}

impl PeerVersion {
    /// Version spoken by this library
    pub const CURRENT: Self = Self::new(4, 2, 0);

    #[must_use]
    pub const fn new(major: u8, minor: u8, release: u8) -> Self {
        Self {
            major,
            minor,
            release,
        }
    }

    /// Peers before 3.1 expect node info keyed by hostname rather than
    /// as node-info arrays.
    #[must_use]
    pub const fn understands_node_arrays(self) -> bool {
        !(self.major < 3 || (self.major == 3 && self.minor == 0))
    }
}

impl Default for PeerVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for PeerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.release)
    }
}

/// Type tag of a value as it is stored
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum DataType {
    Undef,
    Bool,
    Byte,
    String,
    /// Internal representation of a long string; never handed to callers
    CompressedString,
    Size,
    Pid,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Double,
    Status,
    ProcRank,
    Proc,
    ByteObject,
    Regex,
    Envar,
    Scope,
    InfoArray,
    Array,
}

/// Environment variable directive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envar {
    pub envar: String,
    pub value: String,
    pub separator: char,
}

/// Tagged value stored under a key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Undef,
    Bool(bool),
    Byte(u8),
    String(String),
    Size(u64),
    Pid(u32),
    Int(i32),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint(u32),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float(f32),
    Double(f64),
    Status(i32),
    Rank(Rank),
    Proc(ProcId),
    Bytes(Vec<u8>),
    Regex(Vec<u8>),
    Envar(Envar),
    Scope(Scope),
    InfoArray(Vec<Info>),
    Array(Vec<Value>),
}

impl Value {
    /// Get the type tag
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Undef => DataType::Undef,
            Self::Bool(_) => DataType::Bool,
            Self::Byte(_) => DataType::Byte,
            Self::String(_) => DataType::String,
            Self::Size(_) => DataType::Size,
            Self::Pid(_) => DataType::Pid,
            Self::Int(_) => DataType::Int,
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Uint(_) => DataType::Uint,
            Self::Uint8(_) => DataType::Uint8,
            Self::Uint16(_) => DataType::Uint16,
            Self::Uint32(_) => DataType::Uint32,
            Self::Uint64(_) => DataType::Uint64,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::Status(_) => DataType::Status,
            Self::Rank(_) => DataType::ProcRank,
            Self::Proc(_) => DataType::Proc,
            Self::Bytes(_) => DataType::ByteObject,
            Self::Regex(_) => DataType::Regex,
            Self::Envar(_) => DataType::Envar,
            Self::Scope(_) => DataType::Scope,
            Self::InfoArray(_) => DataType::InfoArray,
            Self::Array(_) => DataType::Array,
        }
    }

    /// Borrow the string payload, if this is a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert any integer representation to a `u32`
    pub fn as_u32(&self) -> Result<u32> {
        let wide: i128 = match *self {
            Self::Byte(v) | Self::Uint8(v) => v.into(),
            Self::Size(v) | Self::Uint64(v) => v.into(),
            Self::Pid(v) | Self::Uint(v) | Self::Uint32(v) => v.into(),
            Self::Int(v) | Self::Int32(v) | Self::Status(v) => v.into(),
            Self::Int8(v) => v.into(),
            Self::Int16(v) => v.into(),
            Self::Int64(v) => v.into(),
            Self::Uint16(v) => v.into(),
            Self::Rank(r) => r.as_u32().into(),
            _ => {
                return Err(Error::type_mismatch(format!(
                    "expected a number, got {}",
                    self.data_type()
                )));
            }
        };
        u32::try_from(wide)
            .map_err(|_| Error::type_mismatch(format!("value {wide} does not fit in u32")))
    }

    /// Get the rank payload
    pub fn as_rank(&self) -> Result<Rank> {
        match self {
            Self::Rank(r) => Ok(*r),
            other => Err(Error::type_mismatch(format!(
                "expected a rank, got {}",
                other.data_type()
            ))),
        }
    }

    /// Borrow a nested info array
    pub fn as_info_array(&self) -> Result<&[Info]> {
        match self {
            Self::InfoArray(items) => Ok(items),
            other => Err(Error::type_mismatch(format!(
                "expected an info array, got {}",
                other.data_type()
            ))),
        }
    }

    /// Borrow a byte payload (byte object or regex)
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) | Self::Regex(b) => Some(b),
            _ => None,
        }
    }

    /// Interpret the value as a flag; a missing value counts as set
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Self::Undef => true,
            Self::Bool(b) => *b,
            Self::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
            other => other.as_u32().is_ok_and(|v| v != 0),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Uint32(v)
    }
}

impl From<Rank> for Value {
    fn from(r: Rank) -> Self {
        Self::Rank(r)
    }
}

impl From<Vec<Info>> for Value {
    fn from(items: Vec<Info>) -> Self {
        Self::InfoArray(items)
    }
}

/// Directive flags carried by an [`Info`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoFlags(u32);

impl InfoFlags {
    pub const NONE: Self = Self(0);
    /// The info disambiguates a key rather than being data itself
    pub const QUALIFIER: Self = Self(1);
    pub const REQUIRED: Self = Self(1 << 1);
    pub const OPTIONAL: Self = Self(1 << 2);
    pub const PERSISTENT: Self = Self(1 << 3);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Key, value and directive flags
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub key: String,
    pub value: Value,
    pub flags: InfoFlags,
}

impl Info {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags: InfoFlags::NONE,
        }
    }

    /// Create an info marked as a qualifier
    pub fn qualifier(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            flags: InfoFlags::QUALIFIER,
        }
    }

    #[must_use]
    pub const fn is_qualifier(&self) -> bool {
        self.flags.contains(InfoFlags::QUALIFIER)
    }

    #[must_use]
    pub fn check_key(&self, key: &str) -> bool {
        self.key == key
    }
}

/// Key/value pair as held by the tables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn check_key(&self, key: &str) -> bool {
        self.key == key
    }
}

impl From<Info> for KeyValue {
    fn from(info: Info) -> Self {
        Self {
            key: info.key,
            value: info.value,
        }
    }
}

impl From<KeyValue> for Info {
    fn from(kv: KeyValue) -> Self {
        Self::new(kv.key, kv.value)
    }
}
