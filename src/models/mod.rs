pub mod image;
pub mod label;
pub mod run;
pub mod schema;
