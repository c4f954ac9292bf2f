pub mod health;
pub mod package;
