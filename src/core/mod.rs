pub mod auth;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod interceptor;
pub mod jobs;
pub mod lifecycle;
pub mod operator;
pub mod outbound;
pub mod store;
pub mod tenant;
pub mod terminal;
