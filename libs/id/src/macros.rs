//! Macros for defining typed ID types.

/// Macro to define a typed, string-backed ID with a generation prefix.
///
/// This generates a newtype wrapper around `String` with:
/// - A `PREFIX` constant used by `new()`
/// - `new()` to generate a fresh `{prefix}_{ulid}` ID
/// - `parse()` to validate an externally supplied ID
/// - `Display`, `FromStr`, `From<&str>` and `From<String>` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// Externally supplied IDs are not required to carry the prefix: agents name
/// themselves and callers may pick their own allocation IDs.
///
/// # Example
///
/// ```ignore
/// define_id!(AgentId, "agent");
///
/// let generated = AgentId::new();
/// let named: AgentId = "gpu-node-7".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix for generated IDs of this type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, $crate::Ulid::new()))
            }

            /// Parses an ID from a string.
            ///
            /// The string must be non-empty and free of whitespace and control
            /// characters.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::validate(s)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true if the ID holds no characters.
            ///
            /// Only reachable through the unchecked `From` conversions.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
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

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
