#![forbid(unsafe_code)]

pub mod directory;
pub mod processor;
pub mod store;

#[cfg(test)]
mod directory_tests;
#[cfg(test)]
mod processor_tests;
