pub mod command;
pub mod models;
pub mod parser;
pub mod settings;
