//! Built-in observers.

mod backup;
mod console;
mod upload;

pub use backup::BackupCallback;
pub use console::ConsoleCallback;
pub use upload::UploadCallback;
