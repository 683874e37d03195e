//! Strong types for identifiers
//!
//! Semantic newtypes over `String`, replacing raw strings for peer,
//! resource and sub-object ids. All of them order lexicographically,
//! which is what writer election relies on.

use std::fmt;

/// Macro to define string identifiers with strong types.
///
/// Args:
/// - $name: The name of the struct (e.g., PeerId)
/// - $doc: Documentation string
macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

define_id!(PeerId, "Stable, sortable identity of a connected session participant.");
define_id!(ResourceId, "Identity of a shared mutable unit guarded by the engine.");
define_id!(SubObjectId, "Store-assigned identity of a sub-object inside a resource.");

/// Structured record fields, as persisted by the document store.
pub type Fields = serde_json::Map<String, serde_json::Value>;
