//! Printing that never touches the heap. Anything that runs inside the
//! allocator (including the abort path) must print through here, because
//! `println!()` may allocate and we might *be* the allocator.

use libc::{c_void, STDOUT_FILENO};

const LINE_CAPACITY: usize = 256;

/// A fixed-size line buffer that is flushed straight to `stdout` with
/// `write(2)`.
pub struct LineBuf {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuf {
    pub const fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.len + bytes.len() > LINE_CAPACITY {
            self.flush();
        }
        if bytes.len() > LINE_CAPACITY {
            write_all(bytes);
            return;
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    pub fn flush(&mut self) {
        write_all(&self.buf[..self.len]);
        self.len = 0;
    }
}

impl Default for LineBuf {
    fn default() -> Self {
        Self::new()
    }
}

fn write_all(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a valid slice for its whole length
        let n = unsafe { libc::write(STDOUT_FILENO, bytes.as_ptr() as *const c_void, bytes.len()) };
        if n < 0 {
            // SAFETY: errno is thread local and always readable
            if unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Anything that can be written into a [`LineBuf`] without allocating.
pub trait Put {
    fn put(&self, line: &mut LineBuf);
}

impl Put for str {
    fn put(&self, line: &mut LineBuf) {
        line.push(self.as_bytes());
    }
}

impl Put for usize {
    fn put(&self, line: &mut LineBuf) {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        let mut n = *self;
        loop {
            i -= 1;
            digits[i] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        line.push(&digits[i..]);
    }
}

impl Put for i32 {
    fn put(&self, line: &mut LineBuf) {
        if *self < 0 {
            line.push(b"-");
        }
        (self.unsigned_abs() as usize).put(line);
    }
}

/// Print an address (or anything else) as `0x`-prefixed hex
#[derive(Clone, Copy)]
pub struct Hex(pub usize);

impl Put for Hex {
    fn put(&self, line: &mut LineBuf) {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut out = [0u8; 2 + 2 * std::mem::size_of::<usize>()];
        let mut i = out.len();
        let mut n = self.0;
        loop {
            i -= 1;
            out[i] = DIGITS[n & 0xf];
            n >>= 4;
            if n == 0 {
                break;
            }
        }
        line.push(b"0x");
        line.push(&out[i..]);
    }
}

impl<T: Put + ?Sized> Put for &T {
    fn put(&self, line: &mut LineBuf) {
        (**self).put(line)
    }
}

/// `print!()` that does not allocate. Arguments are separate expressions,
/// each of which must implement [`Put`](crate::util::print::Put):
///
/// ```
/// use guardheap::{put, util::print::Hex};
/// put!("ptr = ", Hex(0x1000), ", size = ", 42usize);
/// ```
#[macro_export]
macro_rules! put {
    ($($arg:expr),* $(,)?) => {{
        let mut line = $crate::util::print::LineBuf::new();
        $( $crate::util::print::Put::put(&$arg, &mut line); )*
        line.flush();
    }};
}

/// [`put!()`] with a trailing newline
#[macro_export]
macro_rules! putln {
    ($($arg:expr),* $(,)?) => {{
        let mut line = $crate::util::print::LineBuf::new();
        $( $crate::util::print::Put::put(&$arg, &mut line); )*
        line.push(b"\n");
        line.flush();
    }};
}
