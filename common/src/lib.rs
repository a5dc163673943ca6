//! Shared data model for the tessera storage client.
//!
//! This crate holds everything both the download engine and the surrounding
//! service layers need to agree on:
//!
//! - **Identity types**: host public keys, sector roots, contract ids. All of
//!   them are 32-byte values that travel as hex strings over the wire.
//! - **Object model**: objects, slabs, slab slices and sectors, together with
//!   the erasure codec and the stream cipher (see [`object`]).
//! - **Network constants**: sector and leaf sizes fixed by the protocol.

pub mod object;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size of one sector on the wire. Sectors are always transmitted whole by
/// hosts but may be read in arbitrary sub-ranges.
pub const SECTOR_SIZE: usize = 1 << 22; // 4 MiB

/// Size of one Merkle leaf within a sector. Slab data is striped across the
/// data shards in leaf-sized rows, so every aligned read starts on a leaf
/// boundary.
pub const LEAF_SIZE: u32 = 64;

macro_rules! hex_bytes_32 {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(b: [u8; 32]) -> Self {
                Self(b)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut b = [0u8; 32];
                hex::decode_to_slice(s, &mut b)?;
                Ok(Self(b))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

hex_bytes_32!(PublicKey, "Ed25519 public key identifying a host.");
hex_bytes_32!(Hash256, "32-byte Merkle root identifying one encoded sector.");
hex_bytes_32!(ContractId, "File contract id granting access to a host.");

/// The usable address to reach a host plus the credentials to pay it.
/// Supplied per download invocation by the contract store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub host_key: PublicKey,
    pub host_addr: String,
}

/// An amount of currency, in the network's base unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Currency(pub u128);

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add for Currency {
    type Output = Currency;

    fn add(self, rhs: Currency) -> Currency {
        Currency(self.0.saturating_add(rhs.0))
    }
}
