pub mod local;
pub mod scan;
pub mod staging;
pub mod types;

pub use local::LocalFs;
pub use scan::scan_project;
pub use staging::{check_control_dir, Area, StagingArea};
pub use types::{Checkout, FileRecord};
