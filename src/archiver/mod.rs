//! Core archiving pipeline split into modular components (`domain`,
//! `queue`, `processor`, `ffmpeg`, `archive_index`, `adapters`).

pub mod adapters;
pub mod archive_index;
pub mod domain;
pub mod error;
pub mod ffmpeg;
pub mod processor;
pub mod queue;
pub mod settings;
pub mod shutdown;

pub use processor::Processor;
