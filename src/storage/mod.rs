pub mod schema;
pub mod tuple;
pub mod value;
