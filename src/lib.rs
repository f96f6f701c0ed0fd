pub mod config;
pub mod db;
pub mod mailer;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod services;
