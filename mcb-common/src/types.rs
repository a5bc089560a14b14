//! # Key Type
//!
//! Validated cache key. Keys are borrowed from the caller and checked against
//! the protocol limit once, before any request bytes are produced.

use std::fmt;

use crate::error::{Error, Result};
use crate::protocol::MAX_KEY_SIZE;

/// Key type with bounded size
///
/// Keys are limited to 250 bytes of UTF-8 by the server; anything longer is
/// rejected here so the request never reaches the socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key<'a> {
    text: &'a str,
}

impl<'a> Key<'a> {
    /// Creates a new Key from a string slice
    ///
    /// # Errors
    /// Returns `Error::KeyTooLong` if the UTF-8 encoding exceeds MAX_KEY_SIZE
    ///
    /// # Examples
    /// ```rust
    /// use mcb_common::{Error, Key, MAX_KEY_SIZE};
    ///
    /// let key = Key::new("alpha").expect("valid key");
    /// assert_eq!(key.as_bytes(), b"alpha");
    ///
    /// let too_long = "x".repeat(MAX_KEY_SIZE + 1);
    /// assert!(matches!(Key::new(&too_long), Err(Error::KeyTooLong { len: 251 })));
    /// ```
    pub fn new(text: &'a str) -> Result<Self> {
        if text.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLong { len: text.len() });
        }
        Ok(Key { text })
    }

    /// Returns the key as UTF-8 bytes
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.text.as_bytes()
    }

    #[inline]
    pub fn as_str(&self) -> &'a str {
        self.text
    }

    /// Returns the key length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Returns true if key is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Debug for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", self.text)
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text)
    }
}
