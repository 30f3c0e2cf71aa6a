pub mod actor;
pub mod threshold;
