mod demo;
mod root;
mod schema;

pub use root::Cli;
