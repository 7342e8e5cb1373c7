pub mod common;
mod staging_tests;
