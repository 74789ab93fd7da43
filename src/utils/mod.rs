pub mod auth;
pub mod formula;
pub mod hash;
pub mod keyed_mutex;
pub mod validation;
