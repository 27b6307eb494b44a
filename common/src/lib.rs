pub mod domain;
pub mod image;
pub mod labels;
pub mod models;

pub use domain::DomainName;
pub use image::ImageReference;
