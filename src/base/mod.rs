pub mod stack;
pub mod utils;
