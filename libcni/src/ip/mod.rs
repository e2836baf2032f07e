pub mod link;
pub mod route;
