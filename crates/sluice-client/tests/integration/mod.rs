pub mod fixture;
mod gitlab_tests;
mod transport_tests;
