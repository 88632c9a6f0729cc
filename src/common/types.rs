//! Identifier types shared across the blob subsystem

use crate::common::hash::{content_hash, ContentHasher, HASH_LEN};
use crate::common::utils::validate_name;
use crate::common::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Result<Self> {
                let name = name.into();
                validate_name(&name)?;
                Ok(Self(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.0
            }
        }
    };
}

name_type!(
    /// Logical tenant / partition owning blobs and references
    NamespaceId
);
name_type!(
    /// Group of named references inside a namespace
    BucketId
);
name_type!(
    /// Key of a named reference inside a bucket
    RefId
);

macro_rules! hash_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; HASH_LEN]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
                Self(bytes)
            }

            /// Identifier of a byte sequence
            pub fn from_blob(data: &[u8]) -> Self {
                Self(content_hash(data))
            }

            pub fn from_hasher(hasher: &ContentHasher) -> Self {
                Self(hasher.finalize())
            }

            pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| Error::InvalidId(format!("{}: {}", s, e)))?;
                let bytes: [u8; HASH_LEN] = bytes.try_into().map_err(|_| {
                    Error::InvalidId(format!("{}: expected {} hex characters", s, HASH_LEN * 2))
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hash_type!(
    /// Content hash identifying a stored byte sequence
    BlobId
);
hash_type!(
    /// Hash of decompressed content, mapped to the blobs that store it
    ContentId
);

impl From<ContentId> for BlobId {
    fn from(id: ContentId) -> Self {
        BlobId(id.0)
    }
}

/// Typed edge pointing at a blob from whatever keeps it reachable
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobReference {
    /// A named reference (bucket + key) holds the blob
    Ref { bucket: BucketId, key: RefId },
    /// Another blob depends on the blob
    Blob { blob_id: BlobId },
}

impl fmt::Display for BlobReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobReference::Ref { bucket, key } => write!(f, "ref:{}/{}", bucket, key),
            BlobReference::Blob { blob_id } => write!(f, "blob:{}", blob_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_id_roundtrip_hex() {
        let id = BlobId::from_blob(b"hello");
        let hex = id.to_string();
        assert_eq!(hex.len(), 40);
        assert_eq!(hex.parse::<BlobId>().unwrap(), id);
    }

    #[test]
    fn test_blob_id_rejects_bad_input() {
        assert!("not-hex".parse::<BlobId>().is_err());
        assert!("abcd".parse::<BlobId>().is_err());
    }

    #[test]
    fn test_namespace_validation() {
        assert!(NamespaceId::new("ddc-test").is_ok());
        assert!(NamespaceId::new("").is_err());
        assert!(NamespaceId::new("a/b").is_err());
        assert!(NamespaceId::new("..").is_err());
        assert!(NamespaceId::new(".").is_err());
        assert!(serde_json::from_str::<NamespaceId>("\"..\"").is_err());
    }

    #[test]
    fn test_reference_serde() {
        let r = BlobReference::Ref {
            bucket: BucketId::new("bucket").unwrap(),
            key: RefId::new("key").unwrap(),
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.starts_with("{\"ref\":"));
        let back: BlobReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
