//! Incremental harvester for comic chapter upload times.
//!
//! Walks the catalogue listing, the chapter list of every comic and the
//! content of every chapter not yet stored, records upload times in a local
//! SQLite store and renders one JSON document per comic.

pub mod config;
pub mod database;
mod error;
mod macros;
pub mod notify;
pub mod parse;
pub mod process;
pub mod request;
pub mod webnovel;

pub use error::{Error, Result};
