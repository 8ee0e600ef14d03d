pub mod cli;
pub mod console;
pub mod headless;

pub use cli::Cli;
pub use headless::run_headless;
