pub mod config;
pub mod env;
pub mod health;
pub mod ingress;
pub mod logs;
pub mod scratches;
pub mod services;
pub mod webhook;
