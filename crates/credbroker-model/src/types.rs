//! Newtype wrappers for platform-assigned identifiers.
//!
//! All newtypes serialize/deserialize as plain strings so stored records stay
//! readable by anything that only knows the JSON layout.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Platform-assigned service instance identifier. Primary key of an
    /// [`InstanceRecord`](crate::InstanceRecord).
    InstanceId
);

string_newtype!(
    /// Platform-assigned binding identifier, unique within one instance.
    BindingId
);

string_newtype!(
    /// Identifier of the application consuming a binding.
    AppId
);

string_newtype!(
    /// Name of the service plan that selects an operator.
    PlanName
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_display_and_as_ref() {
        let id = InstanceId::new("abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(AsRef::<str>::as_ref(&id), "abc123");
    }

    #[test]
    fn newtypes_serialize_as_plain_strings() {
        let id = BindingId::new("b-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"b-1\"");
        let back: BindingId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn plan_name_compares_with_str() {
        let plan = PlanName::from("simple");
        assert_eq!(plan, "simple");
        assert_eq!(plan.into_inner(), "simple");
    }
}
