pub mod api;
pub mod tracker;

pub use api::router;
