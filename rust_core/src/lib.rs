// Core modules (used by services)
pub mod auth;
pub mod clients;
pub mod db;
pub mod models;
pub mod utils;
