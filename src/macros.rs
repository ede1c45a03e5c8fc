//! Declaration macros.
//!
//! [`partial_array!`] declares a group once, where its consumers can see it.
//! [`fragment!`] adds elements to it from any module, any number of times. The
//! group name is the identifier of the declared static and must be in scope
//! where a fragment is written.

/// Declares a partial array whose length is only known after linking.
///
/// ```
/// use partlink::{fragment, partial_array};
///
/// pub struct HashAlgorithm {
///     pub name: &'static str,
///     pub digest_len: usize,
/// }
///
/// partial_array! {
///     pub static HASH_ALGORITHMS: [HashAlgorithm];
/// }
///
/// fragment! {
///     HASH_ALGORITHMS: [HashAlgorithm] = [
///         HashAlgorithm { name: "SHA1", digest_len: 20 },
///         HashAlgorithm { name: "SHA256", digest_len: 32 },
///     ];
/// }
///
/// fn main() {
///     assert_eq!(HASH_ALGORITHMS.len(), 2);
///     assert!(HASH_ALGORITHMS.iter().any(|h| h.name == "SHA256"));
/// }
/// ```
///
/// Zero-sized element types are rejected while the declaration is compiled.
///
/// A group has exactly one declaration. A second one under the same name, in
/// any module or crate, fails to build instead of sharing the section:
///
/// ```compile_fail
/// mod narrow {
///     use partlink::{fragment, partial_array};
///
///     partial_array! {
///         pub static ITEMS: [u32];
///     }
///
///     fragment! { ITEMS: [u32] = [1, 2]; }
/// }
///
/// mod wide {
///     use partlink::{fragment, partial_array};
///
///     partial_array! {
///         pub static ITEMS: [u64];
///     }
///
///     fragment! { ITEMS: [u64] = [3]; }
/// }
///
/// fn main() {
///     assert_eq!(narrow::ITEMS.len(), 2);
///     assert_eq!(wide::ITEMS.len(), 1);
/// }
/// ```
#[macro_export]
macro_rules! partial_array {
    ($(#[$attr:meta])* $vis:vis static $name:ident: [$ty:ty] $(;)?) => {
        $(#[$attr])*
        $vis static $name: $crate::PartialArray<$ty> = {
            extern "Rust" {
                #[link_name = concat!("__start_partial_array_", stringify!($name))]
                static START: [$ty; 0];
                #[link_name = concat!("__stop_partial_array_", stringify!($name))]
                static STOP: [$ty; 0];
            }

            // Keeps the section, and both boundary symbols, alive when no
            // fragment contributes anything. Mutable so every contribution to
            // the section carries the same writable flags.
            #[used]
            #[link_section = concat!("partial_array_", stringify!($name))]
            static mut ANCHOR: [$ty; 0] = [];

            // One definition per group across the whole program.
            #[used]
            #[export_name = concat!("__partial_array_decl_", stringify!($name))]
            static GUARD: u8 = 0;

            #[used]
            #[link_section = "partial_array_meta"]
            static DECLARATION: $crate::GroupDescriptor =
                $crate::GroupDescriptor::declaration::<$ty>(stringify!($name));

            unsafe {
                $crate::PartialArray::from_bounds(
                    stringify!($name),
                    ::core::ptr::addr_of!(START).cast::<$ty>(),
                    ::core::ptr::addr_of!(STOP).cast::<$ty>(),
                )
            }
        };
    };
}

/// Contributes elements to a partial array declared with [`partial_array!`].
///
/// The element type must be the declared one:
///
/// ```compile_fail
/// use partlink::{fragment, partial_array};
///
/// partial_array! {
///     static WIDTHS: [u32];
/// }
///
/// fragment! {
///     WIDTHS: [u64] = [8, 16];
/// }
///
/// fn main() {}
/// ```
#[macro_export]
macro_rules! fragment {
    ($group:ident: [$ty:ty] = [$($elem:expr),* $(,)?] $(;)?) => {
        const _: () = {
            const LEN: usize = <[&str]>::len(&[$(stringify!($elem)),*]);

            const _: fn() -> &'static $crate::PartialArray<$ty> = || &$group;

            #[used]
            #[link_section = concat!("partial_array_", stringify!($group))]
            static mut FRAGMENT: [$ty; LEN] = [$($elem),*];

            #[used]
            #[link_section = "partial_array_meta"]
            static DESCRIPTOR: $crate::GroupDescriptor =
                $crate::GroupDescriptor::fragment::<$ty>(stringify!($group), LEN);
        };
    };
}
