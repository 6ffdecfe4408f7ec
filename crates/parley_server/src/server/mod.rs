#![forbid(unsafe_code)]

pub mod gateway;
pub mod identity;
pub mod listener;
pub mod recent;
pub mod registry;


#[cfg(test)]
mod registry_tests;
