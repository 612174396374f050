pub mod chat;
pub mod embed;
pub mod models;
pub mod remove;
pub mod serve;
pub mod show;
