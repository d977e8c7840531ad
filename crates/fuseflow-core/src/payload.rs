//! Element type tags and the closed payload union carried by batches.
//!
//! A stage multiplexes several element types, so a batch payload has to say
//! which type it carries. Instead of open-ended runtime type inspection the
//! payload is a closed enum chosen when the batch is built: one variant per
//! element type, each wrapping a `Vec` of elements. The [`stream_payload!`]
//! macro generates such an enum together with the [`Payload`] and
//! [`Element`] impls the engine needs.
//!
//! ```rust,ignore
//! fuseflow_core::stream_payload! {
//!     pub enum Msg {
//!         Ints(i64) => "i64",
//!         Strings(String) => "string",
//!     }
//! }
//!
//! let batch = <i64 as Element<Msg>>::wrap(vec![1, 2, 3]);
//! assert_eq!(batch.type_tag(), TypeTag::new("i64"));
//! ```
//!
//! [`stream_payload!`]: crate::stream_payload

use std::fmt;

/// Name of a declared element type.
///
/// Tags are compared by string value, so two tags created from the same name
/// are equal regardless of where they were constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(&'static str);

impl TypeTag {
    /// Creates a tag from a static type name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Closed union of element vectors carried by a batch.
pub trait Payload: fmt::Debug + Send + 'static {
    /// Tag of the element type held by this payload.
    fn type_tag(&self) -> TypeTag;

    /// Number of elements in the payload.
    fn len(&self) -> usize;

    /// Returns `true` if the payload holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An element type that is one variant of the payload union `P`.
pub trait Element<P: Payload>: Clone + Send + 'static {
    /// Tag identifying this element type inside `P`.
    const TAG: TypeTag;

    /// Wraps elements into the matching payload variant.
    fn wrap(items: Vec<Self>) -> P;

    /// Extracts elements from a payload.
    ///
    /// # Errors
    ///
    /// Hands the payload back unchanged if it holds a different variant.
    fn unwrap(payload: P) -> Result<Vec<Self>, P>;
}

/// Declares a payload enum and wires each variant's element type into it.
///
/// Each variant is written as `Variant(ElementType) => "tag"`. Every element
/// type may appear in at most one variant.
#[macro_export]
macro_rules! stream_payload {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident ( $ty:ty ) => $tag:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis enum $name {
            $(
                #[allow(missing_docs)]
                $variant(::std::vec::Vec<$ty>),
            )+
        }

        impl $crate::payload::Payload for $name {
            fn type_tag(&self) -> $crate::payload::TypeTag {
                match self {
                    $( Self::$variant(_) => $crate::payload::TypeTag::new($tag), )+
                }
            }

            fn len(&self) -> usize {
                match self {
                    $( Self::$variant(items) => items.len(), )+
                }
            }
        }

        $(
            impl $crate::payload::Element<$name> for $ty {
                const TAG: $crate::payload::TypeTag = $crate::payload::TypeTag::new($tag);

                fn wrap(items: ::std::vec::Vec<Self>) -> $name {
                    $name::$variant(items)
                }

                fn unwrap(payload: $name) -> ::std::result::Result<::std::vec::Vec<Self>, $name> {
                    #[allow(unreachable_patterns)]
                    match payload {
                        $name::$variant(items) => ::std::result::Result::Ok(items),
                        other => ::std::result::Result::Err(other),
                    }
                }
            }
        )+
    };
}
