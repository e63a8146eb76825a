pub mod filename;
pub mod probe;
pub mod ytdl;
