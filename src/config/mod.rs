//! Property surface of codec and sink instances

mod property;
mod schema;

pub use property::Property;
pub use schema::{ElementSettings, PropertyRanges};
