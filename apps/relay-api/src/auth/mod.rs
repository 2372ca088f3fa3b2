pub mod access;
pub mod middleware;
pub mod tokens;
