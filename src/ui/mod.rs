pub mod icons;
pub mod progress;

pub use progress::{RunUI, format_duration};
