mod delete;
pub mod key;
mod scan;
mod tree;

pub use key::IndexKey;
pub use scan::{IndexScanIter, RangeBound};
pub use tree::IndexTree;
