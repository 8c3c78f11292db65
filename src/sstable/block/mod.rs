pub mod builder;
pub mod reader;
