//! Keys and values cross the disk boundary as bytes.  A [`Serializer`]
//! converts in both directions; key serializers must be deterministic,
//! since stores index entries by the encoded key.
use std::any::TypeId;
use std::path::PathBuf;

use crate::error::Error;
use crate::error::Result;

pub trait Serializer<T>: Send + Sync + 'static {
    /// Appends the encoding of `value` to `out`.
    fn write(&self, value: &T, out: &mut Vec<u8>) -> Result<()>;

    /// Decodes a value from exactly `bytes`.
    fn read(&self, bytes: &[u8]) -> Result<T>;
}

/// The identity of a serializer implementation.  Two registrations of
/// the same indexed cache are only compatible when their serializers
/// have the same identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SerializerIdentity {
    type_id: TypeId,
    type_name: &'static str,
}

impl SerializerIdentity {
    pub fn of<S: 'static>() -> SerializerIdentity {
        SerializerIdentity {
            type_id: TypeId::of::<S>(),
            type_name: std::any::type_name::<S>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Display for SerializerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name)
    }
}

/// UTF-8 strings, stored without any framing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn write(&self, value: &String, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Raw byte strings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn write(&self, value: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Big-endian `u64`s, so encoded keys sort like the integers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn write(&self, value: &u64, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            Error::Serialization(format!("expected 8 bytes for a u64, found {}", bytes.len()))
        })?;
        Ok(u64::from_be_bytes(raw))
    }
}

/// Filesystem paths, as their raw OS bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PathSerializer;

#[cfg(unix)]
impl Serializer<PathBuf> for PathSerializer {
    fn write(&self, value: &PathBuf, out: &mut Vec<u8>) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;

        out.extend_from_slice(value.as_os_str().as_bytes());
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<PathBuf> {
        use std::os::unix::ffi::OsStrExt;

        Ok(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
    }
}

#[cfg(not(unix))]
impl Serializer<PathBuf> for PathSerializer {
    fn write(&self, value: &PathBuf, out: &mut Vec<u8>) -> Result<()> {
        let path = value
            .to_str()
            .ok_or_else(|| Error::Serialization(format!("{} is not UTF-8", value.display())))?;
        out.extend_from_slice(path.as_bytes());
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> Result<PathBuf> {
        StringSerializer.read(bytes).map(PathBuf::from)
    }
}

#[test]
fn test_identity_distinguishes_types() {
    assert_eq!(
        SerializerIdentity::of::<StringSerializer>(),
        SerializerIdentity::of::<StringSerializer>()
    );
    assert_ne!(
        SerializerIdentity::of::<StringSerializer>(),
        SerializerIdentity::of::<BytesSerializer>()
    );
    assert!(SerializerIdentity::of::<U64Serializer>()
        .type_name()
        .ends_with("U64Serializer"));
}

#[test]
fn test_u64_rejects_short_input() {
    assert!(matches!(
        U64Serializer.read(&[1, 2, 3]),
        Err(Error::Serialization(_))
    ));
}

#[test]
fn test_string_rejects_invalid_utf8() {
    assert!(matches!(
        StringSerializer.read(&[0xff, 0xfe]),
        Err(Error::Serialization(_))
    ));
}
