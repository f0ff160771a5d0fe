#![forbid(unsafe_code)]

//! Episode catalog for a fan-subtitling site: video URL resolution, the
//! persisted episode collection, and the admin session gate shared by the
//! `server` and `catalog` binaries.

pub mod config;
pub mod enrich;
pub mod episode;
pub mod error;
pub mod render;
pub mod resolver;
pub mod session;
pub mod stats;
pub mod storage;
pub mod store;
pub mod sync;
