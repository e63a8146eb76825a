pub mod access;
pub mod batch;
pub mod commands;
pub mod responses;
pub mod settings;
pub mod ytdl;
