//! Macro for defining opaque string id types.

/// Defines a newtype around `String` for an id minted by an external
/// system (the resource broker) that bosun stores and echoes back but
/// never interprets.
///
/// The generated type rejects empty strings on parse, and gets `Display`,
/// `FromStr`, serde, `Ord`, and `Hash` implementations.
///
/// # Example
///
/// ```ignore
/// define_opaque_id!(OfferId);
///
/// let offer: OfferId = "f2ce3a06-e99e-4f9c-ac30-a8854f6f8e84-O12".parse()?;
/// ```
#[macro_export]
macro_rules! define_opaque_id {
    ($name:ident) => {
        /// An opaque id minted by the resource broker.
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw broker-supplied id.
            ///
            /// Fails only on an empty string; everything else is opaque.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                Ok(Self(s.to_string()))
            }

            /// Returns the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}
