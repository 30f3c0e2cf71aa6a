pub mod actor;
pub mod normalizer;
