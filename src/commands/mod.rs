pub mod fetch;
pub mod worker;
