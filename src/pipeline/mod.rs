pub mod config;
pub mod digest;
pub mod driver;
pub mod fetch;
pub mod metadata;
pub mod pathing;
pub mod resize;
pub mod runlog;
pub mod runtime;
pub mod settings_layer;
pub mod skyfill;
pub mod stages;
pub mod stitch;
pub mod tools;
