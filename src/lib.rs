// This file makes the crate a library and declares modules for use
// by the binary (main.rs) and integration tests.

pub mod app;
pub mod errors;
pub mod events;
pub mod http;
pub mod paths;
pub mod process;
pub mod proxy;
pub mod settings;
pub mod storage;
pub mod validation;

pub use app::App;
