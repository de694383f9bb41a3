//! Borrowed-or-owned byte buffers.
//!
//! Kernel-owned request buffers are only valid until the reply returns, and
//! handler-produced read data should not be copied just to cross the
//! dispatcher boundary. [`Bytes`] carries either case: a borrow whose
//! lifetime is tied to its producer, or an owned vector that may outlive
//! it. Data crossing a thread boundary is promoted to owned with
//! [`Bytes::into_owned`].

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

/// A byte buffer that is either borrowed from its producer or owned.
pub enum Bytes<'a> {
    /// Borrowed from the producer; must not outlive it.
    Borrowed(&'a [u8]),
    /// Owned by the buffer itself.
    Owned(Vec<u8>),
}

impl<'a> Bytes<'a> {
    /// The empty buffer.
    pub const fn empty() -> Bytes<'static> {
        Bytes::Borrowed(&[])
    }

    /// The byte slice, whichever side owns it.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Bytes::Borrowed(s) => s,
            Bytes::Owned(v) => v,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// True when no bytes are present.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Converts into an owned buffer with `'static` lifetime, copying only
    /// if the data was borrowed.
    pub fn into_owned(self) -> Bytes<'static> {
        match self {
            Bytes::Borrowed(s) => Bytes::Owned(s.to_vec()),
            Bytes::Owned(v) => Bytes::Owned(v),
        }
    }

    /// Consumes the buffer into a `Vec`, copying only if borrowed.
    pub fn into_vec(self) -> Vec<u8> {
        match self {
            Bytes::Borrowed(s) => s.to_vec(),
            Bytes::Owned(v) => v,
        }
    }

    /// A sub-slice view sharing this buffer's lifetime.
    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        &self.as_slice()[start..end]
    }
}

impl Deref for Bytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Bytes<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Borrow<[u8]> for Bytes<'_> {
    fn borrow(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<'a> From<&'a [u8]> for Bytes<'a> {
    fn from(s: &'a [u8]) -> Bytes<'a> {
        Bytes::Borrowed(s)
    }
}

impl From<Vec<u8>> for Bytes<'static> {
    fn from(v: Vec<u8>) -> Bytes<'static> {
        Bytes::Owned(v)
    }
}

impl<'a> From<&'a str> for Bytes<'a> {
    fn from(s: &'a str) -> Bytes<'a> {
        Bytes::Borrowed(s.as_bytes())
    }
}

impl Clone for Bytes<'_> {
    fn clone(&self) -> Self {
        match self {
            Bytes::Borrowed(s) => Bytes::Borrowed(s),
            Bytes::Owned(v) => Bytes::Owned(v.clone()),
        }
    }
}

impl PartialEq for Bytes<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Bytes<'_> {}

impl fmt::Debug for Bytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Bytes::Borrowed(_) => "borrowed",
            Bytes::Owned(_) => "owned",
        };
        write!(f, "Bytes({kind}, {} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrowed_and_owned_compare_equal() {
        let owned: Bytes<'_> = Bytes::Owned(b"abc".to_vec());
        let borrowed: Bytes<'_> = Bytes::Borrowed(b"abc");
        assert_eq!(owned, borrowed);
    }

    #[test]
    fn into_owned_detaches_lifetime() {
        let data = vec![1u8, 2, 3];
        let owned = {
            let b = Bytes::Borrowed(&data[..]);
            b.into_owned()
        };
        assert_eq!(&*owned, &[1, 2, 3]);
    }

    #[test]
    fn deref_gives_slice_ops() {
        let b = Bytes::Borrowed(b"hello");
        assert_eq!(b.len(), 5);
        assert_eq!(&b[1..3], b"el");
        assert!(!b.is_empty());
        assert!(Bytes::empty().is_empty());
    }
}
