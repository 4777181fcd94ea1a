pub mod batch;
pub mod classifier;
pub mod notify;
pub mod providers;
pub mod store;
pub mod sync;
