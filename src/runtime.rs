//! Run-time view of a merged partial array.
//!
//! The linker frames each merged group with two boundary symbols. A
//! [`PartialArray`] holds their addresses and recovers the element count by
//! dividing the distance between them by the element size. Nothing is ever
//! written through these pointers, so reads from any number of threads are
//! fine.

use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::slice;

/// A group assembled at link time. Declared with [`partial_array!`](crate::partial_array).
pub struct PartialArray<T: 'static> {
    name: &'static str,
    start: *const T,
    stop: *const T,
    _marker: PhantomData<&'static [T]>,
}

// SAFETY: the merged block is immutable static data.
unsafe impl<T: Sync> Sync for PartialArray<T> {}

impl<T: 'static> PartialArray<T> {
    /// Binds a group to its boundary symbols.
    ///
    /// # Safety
    ///
    /// `start` and `stop` must frame a region of the image holding only `T`s.
    #[doc(hidden)]
    pub const unsafe fn from_bounds(name: &'static str, start: *const T, stop: *const T) -> Self {
        assert!(core::mem::size_of::<T>() != 0, "partial array elements cannot be zero-sized");
        Self {
            name,
            start,
            stop,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of elements contributed by every fragment in the program.
    pub fn len(&self) -> usize {
        element_count(self.start, self.stop)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &'static [T] {
        let len = self.len();
        if len == 0 {
            return &[];
        }
        // SAFETY: the linker placed `len` contiguous elements at `start`.
        unsafe { slice::from_raw_parts(self.start, len) }
    }

    pub fn iter(&self) -> slice::Iter<'static, T> {
        self.as_slice().iter()
    }
}

impl<T: 'static> Deref for PartialArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<'a, T: 'static> IntoIterator for &'a PartialArray<T> {
    type Item = &'static T;
    type IntoIter = slice::Iter<'static, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for PartialArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialArray")
            .field("name", &self.name)
            .field("elements", &self.as_slice())
            .finish()
    }
}

/// Element count of a merged group.
///
/// The answer never changes for the lifetime of the process.
pub fn partial_array_size<T: 'static>(group: &PartialArray<T>) -> usize {
    group.len()
}

/// `(stop - start) / size_of::<T>()`.
///
/// An element type other than the one the fragments were compiled with yields
/// a meaningless count; nothing here can detect that.
pub fn element_count<T>(start: *const T, stop: *const T) -> usize {
    let size = core::mem::size_of::<T>();
    if size == 0 {
        return 0;
    }
    (stop as usize).saturating_sub(start as usize) / size
}

#[cfg(test)]
mod tests {
    use super::*;

    static BACKING: [u32; 5] = [10, 20, 30, 40, 50];

    fn window(from: usize, to: usize) -> PartialArray<u32> {
        let base = BACKING.as_ptr();
        // SAFETY: both bounds stay inside BACKING.
        unsafe { PartialArray::from_bounds("window", base.wrapping_add(from), base.wrapping_add(to)) }
    }

    #[test]
    fn count_is_distance_over_stride() {
        let base = BACKING.as_ptr();
        assert_eq!(element_count(base, base.wrapping_add(5)), 5);
        assert_eq!(element_count(base, base), 0);
    }

    #[test]
    fn reversed_bounds_count_as_empty() {
        let base = BACKING.as_ptr();
        assert_eq!(element_count(base.wrapping_add(3), base), 0);
    }

    #[test]
    fn view_exposes_framed_elements() {
        let group = window(1, 4);
        assert_eq!(group.name(), "window");
        assert_eq!(group.len(), 3);
        assert_eq!(partial_array_size(&group), 3);
        assert_eq!(group.as_slice(), &[20, 30, 40]);
        assert_eq!(group.iter().copied().sum::<u32>(), 90);
        assert_eq!(group.first(), Some(&20));
    }

    #[test]
    fn empty_view() {
        let group = window(2, 2);
        assert!(group.is_empty());
        assert_eq!(group.as_slice(), &[] as &[u32]);
        assert_eq!((&group).into_iter().count(), 0);
    }

    #[test]
    fn debug_lists_elements() {
        let rendered = format!("{:?}", window(0, 2));
        assert!(rendered.contains("window"));
        assert!(rendered.contains("[10, 20]"));
    }
}
