pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod hardware;
pub mod policy;
pub mod repo;
pub mod telemetry;
