pub mod console;
pub mod debugger;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
