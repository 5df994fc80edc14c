//! HTTP service that downloads videos through yt-dlp and keeps a small store
//! of uploaded cookie jars for authenticated downloads.

pub mod cleanup;
pub mod config;
pub mod cookies;
pub mod download;
pub mod routes;
pub mod sqlite_cookies;
pub mod ytdlp;
