pub mod data;
pub mod echo;
