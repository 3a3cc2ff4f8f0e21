pub mod api;
pub mod clock;
pub mod config;
#[cfg(test)]
mod memory_repo;
mod orm;
pub mod paste_repo;
pub mod paste_service;
