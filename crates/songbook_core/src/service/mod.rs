//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate session calls into use-case level APIs.
//! - Keep CLI callers decoupled from session and store details.

pub mod song_service;
