// Privacy overlay: configuration, blur and the renderer every sink shares.

pub mod blur;
pub mod config;
pub mod error;
pub mod render;
pub mod scale;
