//! Application services between the HTTP layer and the engagement store.

pub mod error;
pub mod feed;
pub mod pagination;
pub mod repos;
