//! Strata CLI - index images into lazy archives and read them back.

pub mod commands;
pub mod output;
