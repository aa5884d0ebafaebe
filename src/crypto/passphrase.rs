//! In-memory passphrase handling

use std::fmt;
use zeroize::Zeroizing;

/// A user passphrase.
///
/// Lives only in process memory; the buffer is wiped on drop and `Debug`
/// never prints it.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Passphrase(Zeroizing::new(value.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        Passphrase::new(value)
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Passphrase::new(value)
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase([REDACTED])")
    }
}
