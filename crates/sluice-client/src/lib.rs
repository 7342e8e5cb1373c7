pub mod auth;
pub mod gitlab;
pub mod graphql;
pub mod transport;

pub use auth::{BearerToken, HeaderToken, HmacSigner};
pub use gitlab::{GitlabPlugin, GitlabProjectLookup, GitlabTaskData};
pub use transport::ReqwestTransport;
