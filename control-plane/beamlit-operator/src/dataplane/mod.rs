pub mod configurer;
pub mod offloader;
