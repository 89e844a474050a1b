// Core modules implementing field storage, blob encoding, querying, and error modeling.
pub mod codec;
pub mod error;
pub mod field;
pub mod query;
pub mod store;
pub mod value;
