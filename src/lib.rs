pub mod agent;
pub mod constants;
pub mod machinery;
pub mod utils;
