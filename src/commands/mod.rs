//! External operations over an [`AppState`](crate::AppState).

pub mod chat;
pub mod knowledge;
