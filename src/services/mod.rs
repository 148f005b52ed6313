pub mod oauth;
pub mod posts;
pub mod profile;
