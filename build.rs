use std::{env, fs, path::Path};

/// `alignof(max_align_t)` on the platforms we support. Whatever replaces
/// libc's `malloc()` has to hand out at least this much.
const MAX_ALIGN_T: usize = 16;

/// Read a numeric knob from the environment, falling back to `default`.
fn knob(name: &str, default: usize) -> usize {
    println!("cargo:rerun-if-env-changed={name}");
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{name} must be an unsigned integer, got {value:?}")),
        Err(_) => default,
    }
}

fn main() {
    let guard_pages = knob("GUARDHEAP_GUARD_PAGES", 1);
    let capacity = knob("GUARDHEAP_REGISTRY_CAPACITY", 1024 * 1024);
    let interpose = env::var_os("CARGO_FEATURE_INTERPOSE").is_some();
    let default_align = knob("GUARDHEAP_DEFAULT_ALIGN", if interpose { MAX_ALIGN_T } else { 1 });

    assert!(guard_pages > 0, "GUARDHEAP_GUARD_PAGES must be at least 1");
    assert!(capacity > 0, "GUARDHEAP_REGISTRY_CAPACITY must be at least 1");
    assert!(
        default_align.is_power_of_two(),
        "GUARDHEAP_DEFAULT_ALIGN must be a power of two"
    );
    // Callers of the real `malloc()` (Rust's `System` allocator among them)
    // rely on `max_align_t` alignment.
    assert!(
        !interpose || default_align >= MAX_ALIGN_T,
        "GUARDHEAP_DEFAULT_ALIGN must be at least {MAX_ALIGN_T} with the `interpose` feature"
    );

    let out = Path::new(&env::var_os("OUT_DIR").expect("cargo sets OUT_DIR")).join("build_config.rs");
    fs::write(
        &out,
        format!(
            "pub const GUARD_PAGES: usize = {guard_pages};\n\
             pub const REGISTRY_CAPACITY: usize = {capacity};\n\
             pub const DEFAULT_ALIGN: usize = {default_align};\n"
        ),
    )
    .expect("could not write build_config.rs");
    println!("cargo:rerun-if-changed=build.rs");
}
