pub use wheel::{WheelFilename, WheelFilenameError};

mod wheel;
