pub mod manifest;
pub mod rewrite;
