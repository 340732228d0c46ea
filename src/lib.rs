// src/lib.rs

//! Program enrichment library: discovers university data-science program
//! pages, extracts their content and summarizes it, tracking every record
//! through a persisted stage machine.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
