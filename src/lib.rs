//! Keeps a catalog of the files under a directory tree in step with the
//! disk, and streams catalogued files to the users that own them.

pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod http;
pub mod models;
