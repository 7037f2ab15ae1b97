/// Round up `n` to the nearest `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// [`round_up()`] that reports overflow instead of wrapping
pub fn checked_round_up(n: usize, to: usize) -> Option<usize> {
    Some(n.checked_add(to - 1)? / to * to)
}

/// Round down `n` to the nearest `to`
pub fn round_down(n: usize, to: usize) -> usize {
    n / to * to
}
