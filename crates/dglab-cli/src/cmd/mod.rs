pub mod config;
pub mod qr;
pub mod serve;
