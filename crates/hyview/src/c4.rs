//! Content-addressed identifiers.
//!
//! A C4 id is a SHA-512 digest over one or more inputs, Base58 encoded and
//! left-padded to a fixed width. Feeding the same inputs in the same order
//! always produces the same id, which makes it usable both as a host node name
//! and as a cache key.
//!
//! ```rust
//! use hyview::c4::{C4, Identifier};
//!
//! let id = Identifier::of(["foo", "bar"])?;
//!
//! let mut c4 = C4::new();
//! c4.update("foo")?.update("bar")?;
//! assert_eq!(c4.identifier(), id);
//! assert_eq!(id.as_str().len(), hyview::c4::ID_LENGTH);
//! # Ok::<(), hyview::c4::C4Error>(())
//! ```
//!
//! Paths that exist on disk are hashed by content rather than by name;
//! directories are crawled recursively in lexicographic order.

use std::any::Any;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::config::expand_home;

/// Total length of an identifier string, prefix included.
pub const ID_LENGTH: usize = 90;

/// Tag every identifier starts with.
pub const PREFIX: &str = "c4";

const ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";
const PAD: char = '1';
const BLOCK_SIZE: usize = 1 << 20;

/// Errors raised while computing or parsing identifiers.
#[derive(Debug, Error)]
pub enum C4Error {
    /// No hasher claimed the value and it has no fallback byte form.
    #[error(
        "cannot hash {type_name} value {debug}; register a custom hasher for it with `Hashers::register`"
    )]
    Unhashable {
        /// Rust type of the offending value.
        type_name: &'static str,
        /// Debug rendering of the offending value.
        debug: String,
    },
    /// A claimed path could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path being hashed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The string is not a well-formed identifier.
    #[error("invalid identifier {0:?}")]
    Invalid(String),
}

/// A value with no byte representation of its own.
///
/// Opaque values only hash when a custom hasher registered through
/// [`Hashers::register`] claims them.
pub struct Opaque {
    type_name: &'static str,
    debug: String,
    value: Box<dyn Any + Send + Sync>,
}

impl Opaque {
    /// Wrap an arbitrary value.
    pub fn new<T: Any + Send + Sync + fmt::Debug>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            debug: format!("{value:?}"),
            value: Box::new(value),
        }
    }

    /// Borrow the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    /// Rust type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opaque")
            .field("type_name", &self.type_name)
            .field("value", &self.debug)
            .finish()
    }
}

/// One input to an identifier.
#[derive(Debug)]
pub enum Datum {
    /// Raw bytes, folded in as-is.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// Integer, folded in as its minimal big-endian encoding.
    Int(i128),
    /// A previously computed identifier.
    Id(Identifier),
    /// A filesystem path. Existing paths are hashed by content.
    Path(PathBuf),
    /// Structured data, folded in as compact JSON with sorted keys.
    Value(serde_json::Value),
    /// A value only a custom hasher can handle.
    Opaque(Opaque),
}

impl Datum {
    /// Structural form of any serializable value.
    pub fn structured<T: Serialize + ?Sized>(value: &T) -> Result<Self, C4Error> {
        serde_json::to_value(value)
            .map(Datum::Value)
            .map_err(|e| C4Error::Unhashable {
                type_name: std::any::type_name::<T>(),
                debug: e.to_string(),
            })
    }

    /// A filesystem path.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Datum::Path(path.into())
    }

    /// An opaque value. See [`Opaque`].
    pub fn opaque<T: Any + Send + Sync + fmt::Debug>(value: T) -> Self {
        Datum::Opaque(Opaque::new(value))
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::Text(value.to_string())
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Datum::Text(value)
    }
}

impl From<&[u8]> for Datum {
    fn from(value: &[u8]) -> Self {
        Datum::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Datum {
    fn from(value: Vec<u8>) -> Self {
        Datum::Bytes(value)
    }
}

macro_rules! int_datum {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Datum {
                fn from(value: $t) -> Self {
                    Datum::Int(i128::from(value))
                }
            }
        )*
    };
}

int_datum!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<usize> for Datum {
    fn from(value: usize) -> Self {
        Datum::Int(value as i128)
    }
}

impl From<Identifier> for Datum {
    fn from(value: Identifier) -> Self {
        Datum::Id(value)
    }
}

impl From<&Identifier> for Datum {
    fn from(value: &Identifier) -> Self {
        Datum::Id(value.clone())
    }
}

impl From<PathBuf> for Datum {
    fn from(value: PathBuf) -> Self {
        Datum::Path(value)
    }
}

impl From<&Path> for Datum {
    fn from(value: &Path) -> Self {
        Datum::Path(value.to_path_buf())
    }
}

impl From<serde_json::Value> for Datum {
    fn from(value: serde_json::Value) -> Self {
        Datum::Value(value)
    }
}

/// Predicate deciding whether a hasher handles a value.
pub type Claim = Arc<dyn Fn(&Datum) -> bool + Send + Sync>;

/// Feeds the byte chunks of a claimed value into the running digest.
pub type Feed = Arc<dyn Fn(&Datum, &mut dyn FnMut(&[u8])) -> Result<(), C4Error> + Send + Sync>;

/// Ordered set of custom hashers.
///
/// The first entry whose claim accepts a value hashes it. New entries go to
/// the front, so the most recently registered claim wins. Unclaimed values use
/// the built-in byte form of their [`Datum`] variant.
#[derive(Clone)]
pub struct Hashers {
    entries: Vec<(Claim, Feed)>,
}

impl Hashers {
    /// A set with no hashers at all, not even the defaults.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a hasher ahead of every existing one.
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use hyview::c4::{C4, Datum, Hashers};
    ///
    /// #[derive(Debug)]
    /// struct Voxel(u8);
    ///
    /// let mut hashers = Hashers::default();
    /// hashers.register(
    ///     |d| matches!(d, Datum::Opaque(o) if o.downcast_ref::<Voxel>().is_some()),
    ///     |d, sink| {
    ///         if let Datum::Opaque(o) = d {
    ///             if let Some(voxel) = o.downcast_ref::<Voxel>() {
    ///                 sink(&[voxel.0]);
    ///             }
    ///         }
    ///         Ok(())
    ///     },
    /// );
    ///
    /// let mut c4 = C4::with_hashers(Arc::new(hashers));
    /// c4.update(Datum::opaque(Voxel(7)))?;
    /// # Ok::<(), hyview::c4::C4Error>(())
    /// ```
    pub fn register<C, F>(&mut self, claim: C, feed: F)
    where
        C: Fn(&Datum) -> bool + Send + Sync + 'static,
        F: Fn(&Datum, &mut dyn FnMut(&[u8])) -> Result<(), C4Error> + Send + Sync + 'static,
    {
        self.entries.insert(0, (Arc::new(claim), Arc::new(feed)));
    }

    /// Number of registered hashers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no hashers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn feed(&self, datum: &Datum, sink: &mut dyn FnMut(&[u8])) -> Result<(), C4Error> {
        for (claim, feed) in &self.entries {
            if claim(datum) {
                return feed(datum, sink);
            }
        }
        feed_fallback(datum, sink)
    }
}

impl Default for Hashers {
    fn default() -> Self {
        let mut hashers = Self::empty();
        hashers.register(claim_identifier, feed_identifier);
        hashers.register(claim_path, feed_path);
        hashers
    }
}

impl fmt::Debug for Hashers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hashers")
            .field("len", &self.entries.len())
            .finish()
    }
}

fn claim_identifier(datum: &Datum) -> bool {
    matches!(datum, Datum::Id(_))
}

fn feed_identifier(datum: &Datum, sink: &mut dyn FnMut(&[u8])) -> Result<(), C4Error> {
    match datum {
        Datum::Id(id) => {
            sink(id.as_str().as_bytes());
            Ok(())
        }
        other => feed_fallback(other, sink),
    }
}

fn claim_path(datum: &Datum) -> bool {
    matches!(datum, Datum::Path(path) if expand_home(path).exists())
}

fn feed_path(datum: &Datum, sink: &mut dyn FnMut(&[u8])) -> Result<(), C4Error> {
    let Datum::Path(path) = datum else {
        return feed_fallback(datum, sink);
    };
    let path = expand_home(path);
    if path.is_dir() {
        for file in walk_files(&path)? {
            feed_file(&file, sink)?;
        }
        Ok(())
    } else {
        feed_file(&path, sink)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> C4Error + '_ {
    move |source| C4Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>, C4Error> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(io_error(dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(dir))?;
    entries.sort();

    let mut files = Vec::new();
    for entry in entries {
        if entry.is_dir() {
            files.extend(walk_files(&entry)?);
        } else {
            files.push(entry);
        }
    }
    Ok(files)
}

fn feed_file(path: &Path, sink: &mut dyn FnMut(&[u8])) -> Result<(), C4Error> {
    let mut file = File::open(path).map_err(io_error(path))?;
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut block).map_err(io_error(path))?;
        if n == 0 {
            return Ok(());
        }
        sink(&block[..n]);
    }
}

fn feed_fallback(datum: &Datum, sink: &mut dyn FnMut(&[u8])) -> Result<(), C4Error> {
    match datum {
        Datum::Bytes(bytes) => sink(bytes),
        Datum::Text(text) => sink(text.as_bytes()),
        Datum::Int(n) => sink(&int_bytes(*n)),
        Datum::Id(id) => sink(id.as_str().as_bytes()),
        Datum::Path(path) => sink(path.as_os_str().as_encoded_bytes()),
        Datum::Value(value) => {
            let bytes = serde_json::to_vec(value).map_err(|e| C4Error::Unhashable {
                type_name: "serde_json::Value",
                debug: e.to_string(),
            })?;
            sink(&bytes);
        }
        Datum::Opaque(opaque) => {
            return Err(C4Error::Unhashable {
                type_name: opaque.type_name,
                debug: opaque.debug.clone(),
            });
        }
    }
    Ok(())
}

/// Minimal big-endian encoding: unsigned for non-negative values, two's
/// complement with a single sign byte for negative ones, empty for zero.
fn int_bytes(n: i128) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let bytes = n.to_be_bytes();
    let skip = if n > 0 {
        bytes.iter().take_while(|b| **b == 0).count()
    } else {
        let mut i = 0;
        while i + 1 < bytes.len() && bytes[i] == 0xff && bytes[i + 1] & 0x80 != 0 {
            i += 1;
        }
        i
    };
    bytes[skip..].to_vec()
}

fn b58encode(bytes: &[u8]) -> String {
    // Little-endian base58 digits. Leading zero bytes vanish, like an integer
    // conversion would; the fixed-width padding puts them back as '1'.
    let mut digits: Vec<u8> = Vec::with_capacity(bytes.len() * 138 / 100 + 1);
    for &byte in bytes {
        let mut carry = u32::from(byte);
        for digit in digits.iter_mut() {
            carry += u32::from(*digit) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    if digits.is_empty() {
        digits.push(0);
    }
    digits
        .iter()
        .rev()
        .map(|&d| char::from(ALPHABET[usize::from(d)]))
        .collect()
}

/// A finished C4 identifier.
///
/// Two identifiers are equal exactly when their digests are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Hash `inputs` in order with the default hashers.
    pub fn of<I, D>(inputs: I) -> Result<Self, C4Error>
    where
        I: IntoIterator<Item = D>,
        D: Into<Datum>,
    {
        let mut c4 = C4::new();
        for input in inputs {
            c4.update(input)?;
        }
        Ok(c4.identifier())
    }

    fn from_digest(digest: &[u8]) -> Self {
        let encoded = b58encode(digest);
        let width = ID_LENGTH - PREFIX.len();

        let mut id = String::with_capacity(ID_LENGTH);
        id.push_str(PREFIX);
        for _ in encoded.len()..width {
            id.push(PAD);
        }
        id.push_str(&encoded);
        Self(id)
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Identifier {
    type Err = C4Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == ID_LENGTH
            && s.starts_with(PREFIX)
            && s[PREFIX.len()..].bytes().all(|b| ALPHABET.contains(&b));
        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(C4Error::Invalid(s.to_string()))
        }
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

static DEFAULT_HASHERS: LazyLock<Arc<Hashers>> = LazyLock::new(|| Arc::new(Hashers::default()));

/// Incremental identifier builder.
#[derive(Clone)]
pub struct C4 {
    digest: Sha512,
    hashers: Arc<Hashers>,
}

impl C4 {
    /// A builder using the default hashers.
    pub fn new() -> Self {
        Self::with_hashers(Arc::clone(&DEFAULT_HASHERS))
    }

    /// A builder using a custom hasher set.
    pub fn with_hashers(hashers: Arc<Hashers>) -> Self {
        Self {
            digest: Sha512::new(),
            hashers,
        }
    }

    /// Fold one more input into the digest.
    pub fn update(&mut self, datum: impl Into<Datum>) -> Result<&mut Self, C4Error> {
        let datum = datum.into();
        let digest = &mut self.digest;
        self.hashers
            .feed(&datum, &mut |chunk: &[u8]| digest.update(chunk))?;
        Ok(self)
    }

    /// The identifier for everything folded in so far.
    pub fn identifier(&self) -> Identifier {
        Identifier::from_digest(&self.digest.clone().finalize())
    }
}

impl Default for C4 {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for C4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("C4").field(&self.identifier().0).finish()
    }
}
