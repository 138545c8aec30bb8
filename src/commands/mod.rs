pub mod compress;
pub mod extract;
pub mod validate;
