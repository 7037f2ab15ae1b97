/// Test if `ptr` is aligned to a multiple of `align`. Unlike
/// `<*const T>::is_aligned_to()` this works for alignments that are not
/// powers of two.
pub fn aligned_to<T>(ptr: *const T, align: usize) -> bool {
    ptr as usize % align == 0
}
