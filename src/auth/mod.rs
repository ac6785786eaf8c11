pub mod authority;
pub mod token;
