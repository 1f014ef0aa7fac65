//! Small internal helpers.

/// Returns the name of the specified type as a string.
macro_rules! name_of {
    ($t:ty) => {{
        const _: fn() = || {
            let _: $t;
        };
        stringify!($t)
    }};
}
pub(crate) use name_of;

/// Implements `Display` in terms of `Debug` for one or more types.
macro_rules! impl_display_via_debug {
    ($($t:ty),* $(,)?) => {$(
        impl ::std::fmt::Display for $t {
            #[inline]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Debug::fmt(self, f)
            }
        }
    )*};
}
pub(crate) use impl_display_via_debug;
