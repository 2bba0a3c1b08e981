pub mod scanner;
pub mod streams;
pub mod temp_manager;
