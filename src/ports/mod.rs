pub mod git;
pub mod hosting;
