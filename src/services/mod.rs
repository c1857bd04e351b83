pub mod broker;
pub mod bundle;
pub mod callback;
pub mod import;
pub mod process;
pub mod tool;
