//! Identifiers for members and groups.

use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum group identifier length.
pub const MAX_GROUP_ID_LENGTH: usize = 256;

/// Length of a member tag in hex characters.
pub const TAG_LENGTH: usize = 6;

static NEXT_MEMBER_KEY: AtomicU64 = AtomicU64::new(1);
static NEXT_GROUP_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Validate a group identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_group_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Group id cannot be empty");
    }
    if id.len() > MAX_GROUP_ID_LENGTH {
        return Err("Group id too long");
    }
    if id.chars().any(char::is_control) {
        return Err("Group id contains control characters");
    }
    Ok(())
}

/// Short printable tag shown to other members alongside a sender's messages.
///
/// Tags are random and may collide; they label messages and are never used
/// to tell members apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberTag(String);

impl MemberTag {
    /// Generate a tag from the thread-local CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        let mut tag = hex::encode(bytes);
        tag.truncate(TAG_LENGTH);
        Self(tag)
    }

    /// Get the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Process-unique identity of one connected member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberKey(u64);

impl MemberKey {
    /// Allocate the next key.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_MEMBER_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Distinguishes successive groups registered under the same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupInstance(u64);

impl GroupInstance {
    /// Allocate the next instance number.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_GROUP_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GroupInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
