mod auth;
mod client;
mod errors;
mod rest;

pub use client::{ApxClient, ApxClientBuilder};
pub use errors::{Error, Result};
pub use rest::RestClient;
