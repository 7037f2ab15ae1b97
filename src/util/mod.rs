pub mod assert;
pub mod hint;
pub mod num;
pub mod print;

#[cfg(test)]
pub(crate) mod child;
