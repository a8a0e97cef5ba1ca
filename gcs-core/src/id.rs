//! Cluster identifiers
//!
//! Fixed-width opaque binary ids. Equality, ordering and hashing are
//! byte-wise; the all-zero value is the nil id used as a wildcard.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{GcsError, Result};

/// Width of every identifier in bytes
pub const ID_SIZE: usize = 20;

/// Untyped identifier shared by all id kinds
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct UniqueId([u8; ID_SIZE]);

impl UniqueId {
    /// The nil (all zero) id
    pub const fn nil() -> Self {
        Self([0; ID_SIZE])
    }

    /// Generate a random id
    pub fn from_random() -> Self {
        let mut bytes = [0u8; ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build an id from exactly `ID_SIZE` raw bytes
    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ID_SIZE] = bytes.try_into().map_err(|_| GcsError::InvalidIdLength {
            expected: ID_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// Parse a lowercase or uppercase hex rendering
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| GcsError::InvalidArgument {
            reason: format!("bad hex id {:?}: {}", s, e),
        })?;
        Self::from_binary(&bytes)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; ID_SIZE]
    }

    pub fn binary(&self) -> &[u8] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueId({})", self.hex())
    }
}

impl Serialize for UniqueId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for UniqueId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UniqueId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(UniqueId);

        impl $name {
            pub const fn nil() -> Self {
                Self(UniqueId::nil())
            }

            pub fn from_random() -> Self {
                Self(UniqueId::from_random())
            }

            pub fn from_binary(bytes: &[u8]) -> Result<Self> {
                UniqueId::from_binary(bytes).map(Self)
            }

            pub fn from_hex(s: &str) -> Result<Self> {
                UniqueId::from_hex(s).map(Self)
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            pub fn binary(&self) -> &[u8] {
                self.0.binary()
            }

            pub fn hex(&self) -> String {
                self.0.hex()
            }

            pub fn unique(&self) -> UniqueId {
                self.0
            }
        }

        impl From<UniqueId> for $name {
            fn from(id: UniqueId) -> Self {
                Self(id)
            }
        }

        impl From<$name> for UniqueId {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0.hex())
            }
        }
    };
}

define_id!(
    /// Job (driver) scope. Nil means "all jobs" when used as a filter.
    JobId
);
define_id!(
    /// Data object id
    ObjectId
);
define_id!(
    /// Task id
    TaskId
);
define_id!(
    /// Cluster client (node) id
    ClientId
);

/// Drivers and jobs share one id space
pub type DriverId = JobId;
