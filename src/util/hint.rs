/// mark some stuff as #[cold]
#[cold]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
