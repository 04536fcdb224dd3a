//! Console devices: COM1 for diagnostics and the VGA text screen.

pub mod screen;
pub mod serial;
