//! Builders to construct relay components from configuration.

pub mod relay_builder;

pub use relay_builder::RelayComponents;
