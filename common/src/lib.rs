pub mod file_format;
pub mod fnv;
pub mod log_setup;

pub use file_format::{load_file, save_file, FileFormat, FileFormatError, FileFormatResult};
pub use fnv::FnvHasher;
