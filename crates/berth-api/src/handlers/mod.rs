//! Request handlers, one module per API area.

pub mod attach;
pub mod containers;
pub mod images;
pub mod system;
