pub mod mirror_cache;
pub mod provisioner;
pub mod sanitizer;
pub mod scheduler;
