pub mod format;
pub mod progress;
