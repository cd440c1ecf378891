pub mod admin;
pub mod system;
