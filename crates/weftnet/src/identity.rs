//! Stable type identity for values crossing the wire.
//!
//! Every sendable type has a *universal name*, a deterministic string
//! spelled like the type itself (`"ChatLine"`, `"Vec<String>"`), and a
//! 64-bit hash of that name computed by [`type_name_hash`]. The hash is
//! what travels in front of every serialized value, so it must be
//! identical on every node for matching types. The hashing function is
//! part of the wire compatibility contract: changing it requires bumping
//! the protocol magics in `weftnet-core`.

/// Hashes a universal name with the SDBM function, scanning right to
/// left and skipping `'>'`, `' '`, and the first colon of every `"::"`.
///
/// The normalization makes spelling variants collapse to the same hash:
/// `"Outer<ns::Inner>"` and `"Outer< ns :: Inner >"` hash identically.
pub const fn type_name_hash(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut hash: u64 = 0;
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        let c = bytes[i];
        if c == b'>' || c == b' ' {
            continue;
        }
        if c == b':' && i + 1 < bytes.len() && bytes[i + 1] == b':' {
            continue;
        }
        hash = (c as u64)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash);
    }
    hash
}

/// Identity of an application type on the wire.
///
/// Implemented by [`declare_type!`](crate::declare_type) for plain user
/// types, by hand for generic ones:
///
/// ```
/// use weftnet::NetType;
///
/// struct Tagged<T>(T);
///
/// impl<T: NetType> NetType for Tagged<T> {
///     fn universal_name() -> String {
///         format!("Tagged<{}>", T::universal_name())
///     }
/// }
/// ```
///
/// Primitives, `String`, `Vec<T>`, and `Option<T>` are provided.
pub trait NetType {
    /// The deterministic name of the type, including the names of any
    /// type parameters.
    fn universal_name() -> String;

    /// The 64-bit identifier derived from the universal name. Equal names
    /// hash equal; distinct names are extremely unlikely to collide.
    fn hash_code() -> u64 {
        type_name_hash(&Self::universal_name())
    }
}

/// Declares a plain (non-generic) type as sendable, mirroring the way the
/// built-in types are declared.
///
/// ```
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct ChatLine {
///     text: String,
/// }
/// weftnet::declare_type!(ChatLine);
/// ```
///
/// An explicit name may be given as the second argument to keep the hash
/// stable across renames: `declare_type!(ChatLineV2, "ChatLine")`.
#[macro_export]
macro_rules! declare_type {
    ($t:ty) => {
        $crate::declare_type!($t, ::std::stringify!($t));
    };
    ($t:ty, $name:expr) => {
        impl $crate::NetType for $t {
            fn universal_name() -> ::std::string::String {
                ::std::string::String::from($name)
            }
        }
    };
}

macro_rules! primitive_net_type {
    ($($t:ty),* $(,)?) => {
        $(
            impl NetType for $t {
                fn universal_name() -> String {
                    String::from(stringify!($t))
                }
            }
        )*
    };
}

primitive_net_type!(
    bool, char, u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64, String,
);

impl NetType for () {
    fn universal_name() -> String {
        String::from("()")
    }
}

impl<T: NetType> NetType for Vec<T> {
    fn universal_name() -> String {
        format!("Vec<{}>", T::universal_name())
    }
}

impl<T: NetType> NetType for Option<T> {
    fn universal_name() -> String {
        format!("Option<{}>", T::universal_name())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
